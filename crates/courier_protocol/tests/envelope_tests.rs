use bytes::BytesMut;
use courier_domain::{ConversationId, Message, MessageId, UserId};
use courier_protocol::framing::try_decode_frame_from_buffer;
use courier_protocol::{ClientFrame, DEFAULT_MAX_FRAME_SIZE, ServerFrame, decode_frame, encode_frame_default};
use proptest::prelude::*;

fn sample_message() -> Message {
	let sender = UserId::new("alice").expect("valid UserId");
	let recipient = UserId::new("bob").expect("valid UserId");
	Message {
		id: MessageId::new_v4(),
		conversation_id: ConversationId::for_pair(&sender, &recipient),
		sender_id: sender,
		recipient_id: recipient,
		content: "hello there".to_string(),
		created_at_unix_ms: 1_700_000_000_000,
		read: false,
		reply_to: None,
		edited: false,
		edited_at_unix_ms: None,
		reactions: Vec::new(),
		deleted_for_everyone: false,
	}
}

#[test]
fn client_frame_roundtrip_through_framing() {
	let frame = ClientFrame::SendPrivateMessage {
		recipient_id: "bob".to_string(),
		content: "hi".to_string(),
		reply_to: None,
	};

	let bytes = encode_frame_default(&frame).expect("encode");
	let (decoded, consumed) = decode_frame::<ClientFrame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(consumed, bytes.len());
	assert_eq!(decoded, frame);
}

#[test]
fn server_frame_roundtrip_with_message_payload() {
	let frame = ServerFrame::NewPrivateMessage {
		message: sample_message(),
	};

	let bytes = encode_frame_default(&frame).expect("encode");
	let (decoded, _) = decode_frame::<ServerFrame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(decoded, frame);
}

#[test]
fn two_frames_in_one_buffer_decode_in_order() {
	let first = ClientFrame::Ping { client_time_unix_ms: 1 };
	let second = ClientFrame::GetOnlineUsers;

	let mut buf = BytesMut::new();
	buf.extend_from_slice(&encode_frame_default(&first).expect("encode"));
	buf.extend_from_slice(&encode_frame_default(&second).expect("encode"));

	let a: ClientFrame = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	let b: ClientFrame = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");

	assert_eq!(a, first);
	assert_eq!(b, second);
	assert!(buf.is_empty());
}

proptest! {
	#[test]
	fn arbitrary_content_survives_framing(content in ".{0,512}") {
		let frame = ClientFrame::SendPrivateMessage {
			recipient_id: "bob".to_string(),
			content,
			reply_to: None,
		};

		let bytes = encode_frame_default(&frame).expect("encode");
		let (decoded, _) = decode_frame::<ClientFrame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		prop_assert_eq!(decoded, frame);
	}
}
