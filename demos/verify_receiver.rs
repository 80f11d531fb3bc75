use acs_notify::{signature_header_value, verify_webhook_request, SIGNATURE_HEADER};

fn main() {
    let secret = b"whsec_supersecret";
    let payload = br#"{"event":"door.offline","timestamp":"2024-05-01T08:00:00Z","deliveryId":"d-1","data":{"doorId":5}}"#;

    // What the sender attaches to the request.
    let signature = signature_header_value(payload, secret);
    let headers = vec![
        (SIGNATURE_HEADER, signature.as_str()),
        ("X-Webhook-Event", "door.offline"),
    ];

    match verify_webhook_request(headers.iter().copied(), payload, secret) {
        Ok(()) => println!("signature ok"),
        Err(err) => println!("rejected: {err}"),
    }

    let tampered = br#"{"event":"door.offline","data":{"doorId":6}}"#;
    if let Err(err) = verify_webhook_request(headers.iter().copied(), tampered, secret) {
        println!("tampered body rejected: {err}");
    }
}
