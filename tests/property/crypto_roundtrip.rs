#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

//! Property-based tests for the message seal/open pipeline and framing.
//!
//! Uses proptest to verify:
//! 1. Any JSON value survives encode -> encrypt -> decrypt -> decode.
//! 2. Any JSON object survives `Message::seal` -> `Message::open`.
//! 3. Tokens never open under a different key.
//! 4. Flipping any byte of a token makes it fail authentication.
//! 5. Random bytes never cause a panic in `decrypt` or `decode_frame`.

use collab_proto::codec;
use collab_proto::crypto::CryptoContext;
use collab_proto::{Message, RelayError};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for arbitrary JSON values without floats (floats do not round-trip
/// bit-exactly through text).
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        ".{0,32}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,12}", inner, 0..8)
                .prop_map(|entries| Value::Object(entries.into_iter().collect())),
        ]
    })
}

/// Strategy for arbitrary JSON objects.
fn arb_object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,12}", arb_json(), 0..8)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #[test]
    fn json_value_round_trips_through_crypto(value in arb_json()) {
        let ctx = CryptoContext::generate();
        let encoded = serde_json::to_vec(&value).unwrap();
        let token = ctx.encrypt(&encoded).unwrap();
        let decoded: Value = serde_json::from_slice(&ctx.decrypt(&token).unwrap()).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn message_round_trips_through_seal_open(map in arb_object()) {
        let ctx = CryptoContext::generate();
        let msg = Message::from(map);
        let token = msg.seal(&ctx).unwrap();
        prop_assert_eq!(Message::open(&token, &ctx).unwrap(), msg);
    }

    #[test]
    fn token_never_opens_under_other_key(map in arb_object()) {
        let sender = CryptoContext::generate();
        let receiver = CryptoContext::generate();
        let token = Message::from(map).seal(&sender).unwrap();
        let result = Message::open(&token, &receiver);
        prop_assert!(matches!(result, Err(RelayError::Authentication(_))));
    }

    #[test]
    fn any_flipped_byte_fails_authentication(
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let ctx = CryptoContext::generate();
        let mut token = ctx.encrypt(&plaintext).unwrap();
        let i = index.index(token.len());
        token[i] ^= mask;
        prop_assert!(ctx.decrypt(&token).is_err());
    }

    #[test]
    fn random_bytes_never_panic_decrypt(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let ctx = CryptoContext::generate();
        let _ = ctx.decrypt(&bytes);
    }

    #[test]
    fn random_bytes_never_panic_decode_frame(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_frame(&bytes, codec::DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn framed_token_is_recovered_intact(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let frame = codec::encode_frame(&payload).unwrap();
        let (body, consumed) = codec::decode_frame(&frame, codec::DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        prop_assert_eq!(body, payload.as_slice());
        prop_assert_eq!(consumed, frame.len());
    }
}
