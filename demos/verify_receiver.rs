//! Receiver-side verification of a signed delivery.

use hookpipe::{signing, HookDefinition, HttpMethod};

fn main() -> hookpipe::Result<()> {
    let definition = HookDefinition::new("order_created", "on order created", HttpMethod::Post, 3);
    let mut configuration = definition.create_configuration(
        "cfg-1",
        "https://example.com/webhook",
        "global",
        None,
    )?;
    configuration.generate_private_key(false)?;

    let body = br#"{"id":"abc","data":{"order_id":123}}"#;
    let signature = signing::sign_body(
        body,
        configuration
            .client_rsa_private_key
            .as_deref()
            .expect("key was generated"),
    )?;

    // What a receiver does with the X-Client-Signature header value.
    let public_key = configuration.public_key()?;
    signing::verify_signature(body, &signature, &public_key)?;
    println!("signature verified");

    Ok(())
}
