use chatgen_common::protocol::chat::{publish_destination, topic_destination, ChatMessage};
use chatgen_common::protocol::reissue::{TokenReissueRequest, TokenReissueResponse, REISSUE_PATH};

// Payload as emitted by the browser front-end and the broker's echo.
const BROKER_ECHO: &str = r#"{
    "sender": { "id": "42", "name": "Load Tester 42", "profileImageUrl": "https://img.test/bot.png" },
    "content": "(Load Test) Message from client 42",
    "streamId": "1"
}"#;

#[test]
fn inbound_payload_deserializes_into_chat_message() {
    let message: ChatMessage = serde_json::from_str(BROKER_ECHO).expect("echo should parse");
    assert_eq!(message.sender.id, "42");
    assert_eq!(message.sender.profile_image_url, "https://img.test/bot.png");
    assert_eq!(message.stream_id, "1");
}

#[test]
fn outbound_payload_matches_inbound_shape() {
    let message: ChatMessage = serde_json::from_str(BROKER_ECHO).expect("echo should parse");
    let reencoded: serde_json::Value =
        serde_json::to_value(&message).expect("message should serialize");
    let original: serde_json::Value = serde_json::from_str(BROKER_ECHO).expect("valid json");
    assert_eq!(reencoded, original);
}

#[test]
fn room_destinations_are_stable() {
    assert_eq!(publish_destination("1"), "/publish/1");
    assert_eq!(topic_destination("1"), "/topic/stream/1/message");
}

#[test]
fn reissue_contract_uses_camel_case_tokens() {
    assert_eq!(REISSUE_PATH, "/api/v1/users/reissue");

    let request = serde_json::to_value(TokenReissueRequest { refresh_token: "r1".into() })
        .expect("request should serialize");
    assert_eq!(request, serde_json::json!({ "refreshToken": "r1" }));

    let response: TokenReissueResponse =
        serde_json::from_str(r#"{ "accessToken": "a2", "refreshToken": "r2" }"#)
            .expect("response should parse");
    assert_eq!(response.access_token, "a2");
    assert_eq!(response.refresh_token, "r2");
}
