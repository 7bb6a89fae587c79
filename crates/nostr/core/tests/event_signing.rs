//! Property tests for event signing and direct-message encryption

use nostr::{
    EventTemplate, Keys, NostrSigner, decrypt, encrypt, finalize_event, get_event_hash,
    verify_event,
};
use proptest::prelude::*;

fn template(content: String, kind: u16, created_at: u64, tags: Vec<Vec<String>>) -> EventTemplate {
    EventTemplate {
        created_at,
        kind,
        tags,
        content,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_signed_events_verify(
        content in ".{0,64}",
        kind in any::<u16>(),
        created_at in 0u64..4_000_000_000,
        tag in "[a-z0-9]{0,16}",
    ) {
        let keys = Keys::generate();
        let event = finalize_event(
            &template(content, kind, created_at, vec![vec!["t".to_string(), tag]]),
            keys.secret_key(),
        ).unwrap();

        prop_assert!(verify_event(&event));
        prop_assert_eq!(get_event_hash(&event.to_unsigned()).unwrap(), event.id);
    }

    #[test]
    fn prop_any_field_change_breaks_verification(
        content in ".{0,64}",
        kind in 0u16..u16::MAX,
        created_at in 0u64..4_000_000_000,
    ) {
        let keys = Keys::generate();
        let event = finalize_event(&template(content, kind, created_at, vec![]), keys.secret_key()).unwrap();

        let mut changed = event.clone();
        changed.content.push('x');
        prop_assert!(!verify_event(&changed));

        let mut changed = event.clone();
        changed.kind ^= 1;
        prop_assert!(!verify_event(&changed));

        let mut changed = event.clone();
        changed.created_at ^= 1;
        prop_assert!(!verify_event(&changed));

        let mut changed = event;
        changed.tags.push(vec!["p".to_string()]);
        prop_assert!(!verify_event(&changed));
    }

    #[test]
    fn prop_dm_roundtrip_between_any_two_keys(message in ".{0,256}") {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let envelope = encrypt(alice.secret_key(), &bob.public_key_hex(), &message).unwrap();
        prop_assert_eq!(
            decrypt(bob.secret_key(), &alice.public_key_hex(), &envelope).unwrap(),
            message.clone()
        );

        let eve = Keys::generate();
        let snooped = decrypt(eve.secret_key(), &alice.public_key_hex(), &envelope);
        prop_assert!(snooped.map_or(true, |text| text != message || message.is_empty()));
    }
}

#[tokio::test]
async fn test_signer_trait_matches_free_functions() {
    let alice = Keys::generate();
    let bob = Keys::generate();

    let envelope = alice
        .nip04_encrypt(&bob.public_key_hex(), "via trait")
        .await
        .unwrap();
    assert_eq!(
        decrypt(bob.secret_key(), &alice.public_key_hex(), &envelope).unwrap(),
        "via trait"
    );

    let unsigned = nostr::build_event("hello", 1, vec![], alice.public_key_hex());
    let event = alice.sign_event(unsigned).await.unwrap();
    assert!(verify_event(&event));
    assert_eq!(event.pubkey, alice.public_key_hex());
}
