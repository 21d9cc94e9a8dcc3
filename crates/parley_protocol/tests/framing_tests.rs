use bytes::BytesMut;
use parley_domain::{MessageId, RoomId};
use parley_protocol::{
	ClientMsg, DEFAULT_MAX_FRAME_SIZE, Envelope, FramingError, ServerMsg, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

fn join(room: &str, request_id: &str) -> Envelope<ClientMsg> {
	Envelope::reply(
		request_id,
		ClientMsg::JoinRoom {
			room_id: RoomId::new(room).expect("valid RoomId"),
		},
	)
}

#[test]
fn encode_decode_roundtrip_slice() {
	let env = join("s-1", "req-1");

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<Envelope<ClientMsg>>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, env);
}

#[test]
fn encode_frame_default_matches_explicit_default_limit() {
	let env = join("s-2", "req-2");

	let a = encode_frame_default(&env).expect("encode_frame_default");
	let b = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");

	assert_eq!(a, b);
}

#[test]
fn decode_requires_full_frame() {
	let env = join("s-3", "req-3");
	let frame = encode_frame_default(&env).expect("encode");

	let err = decode_frame::<Envelope<ClientMsg>>(&frame[..6], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::InsufficientData { need, have } => {
			assert!(need > have);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let first = join("s-4", "req-4");
	let second = Envelope::event(ServerMsg::MessageDeleted {
		room_id: RoomId::new("s-4").expect("valid RoomId"),
		message_id: MessageId::new_v4(),
	});

	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, &first, DEFAULT_MAX_FRAME_SIZE).expect("encode first");
	encode_frame_into(&mut buf, &second, DEFAULT_MAX_FRAME_SIZE).expect("encode second");

	let got_first = try_decode_frame_from_buffer::<Envelope<ClientMsg>>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	assert_eq!(got_first, first);

	let got_second = try_decode_frame_from_buffer::<Envelope<ServerMsg>>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");
	assert_eq!(got_second, second);
	assert!(buf.is_empty());
}

proptest! {
	#[test]
	fn typing_envelope_roundtrips(room in "[a-z0-9-]{1,24}", request_id in "[a-z0-9-]{0,16}", is_typing: bool) {
		let env = Envelope::reply(
			request_id,
			ClientMsg::Typing {
				room_id: RoomId::new(room).expect("non-empty by generator"),
				is_typing,
			},
		);

		let frame = encode_frame_default(&env).expect("encode");
		let (decoded, consumed) = decode_frame::<Envelope<ClientMsg>>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		prop_assert_eq!(consumed, frame.len());
		prop_assert_eq!(decoded, env);
	}
}
