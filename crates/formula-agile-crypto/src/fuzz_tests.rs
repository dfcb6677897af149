#![allow(unexpected_cfgs)]

use proptest::prelude::*;

use super::*;
use crate::package::{ENCRYPTED_PACKAGE_HEADER_LEN, SEGMENT_LENGTH};

// Keep CI runtime bounded; build with `--cfg fuzzing` for heavier runs.
#[cfg(fuzzing)]
const CASES: u32 = 1024;
#[cfg(not(fuzzing))]
const CASES: u32 = 64;

#[cfg(fuzzing)]
const MAX_INPUT_LEN: usize = 256 * 1024;
#[cfg(not(fuzzing))]
const MAX_INPUT_LEN: usize = 32 * 1024;

fn hash_algorithm() -> impl Strategy<Value = HashAlgorithm> {
    prop_oneof![
        Just(HashAlgorithm::Sha1),
        Just(HashAlgorithm::Sha256),
        Just(HashAlgorithm::Sha384),
        Just(HashAlgorithm::Sha512),
    ]
}

fn aes_key() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![Just(16usize), Just(24), Just(32)]
        .prop_flat_map(|len| proptest::collection::vec(any::<u8>(), len))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: CASES,
        max_shrink_iters: 0,
        .. ProptestConfig::default()
    })]

    #[test]
    fn parse_encryption_info_is_panic_free(bytes in proptest::collection::vec(any::<u8>(), 0..=MAX_INPUT_LEN)) {
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| parse_encryption_info(&bytes)));
        prop_assert!(res.is_ok(), "parse_encryption_info panicked");
    }

    #[test]
    fn parse_encryption_info_rejects_malformed_xml(tail in proptest::collection::vec(any::<u8>(), 0..=MAX_INPUT_LEN)) {
        // `<` followed by a byte that is never valid UTF-8 cannot start a valid document.
        let mut bytes = Vec::with_capacity(10 + tail.len());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&0x40u32.to_le_bytes());
        bytes.push(b'<');
        bytes.push(0xFF);
        bytes.extend_from_slice(&tail);

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| parse_encryption_info(&bytes)));
        prop_assert!(res.is_ok(), "parse_encryption_info panicked");
        prop_assert!(res.unwrap().is_err(), "expected malformed XML to be rejected");
    }

    #[test]
    fn decrypt_package_is_panic_free(
        key in proptest::collection::vec(any::<u8>(), 0..40),
        salt in proptest::collection::vec(any::<u8>(), 0..32),
        hash_alg in hash_algorithm(),
        package in proptest::collection::vec(any::<u8>(), 0..=3 * SEGMENT_LENGTH),
    ) {
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            decrypt_package(&key, &salt, hash_alg, package.as_slice())
        }));
        prop_assert!(res.is_ok(), "decrypt_package panicked");

        let res = res.unwrap();
        let body_len = package.len().saturating_sub(ENCRYPTED_PACKAGE_HEADER_LEN);
        let well_formed = package.len() >= ENCRYPTED_PACKAGE_HEADER_LEN
            && body_len % AES_BLOCK_SIZE == 0
            && (body_len == 0 || matches!(key.len(), 16 | 24 | 32));
        prop_assert_eq!(res.is_ok(), well_formed);
        if let Ok(decrypted) = res {
            prop_assert_eq!(decrypted.plaintext.len(), body_len);
        }
    }

    #[test]
    fn package_is_concatenation_of_independent_segments(
        key in aes_key(),
        salt in proptest::collection::vec(any::<u8>(), 16),
        hash_alg in hash_algorithm(),
        blocks in 0usize..=(3 * SEGMENT_LENGTH / AES_BLOCK_SIZE),
        seed in any::<u8>(),
    ) {
        let body: Vec<u8> = (0..blocks * AES_BLOCK_SIZE)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        let mut package = (body.len() as u32).to_le_bytes().to_vec();
        package.extend_from_slice(&[0u8; 4]);
        package.extend_from_slice(&body);

        let decrypted = decrypt_package(&key, &salt, hash_alg, package.as_slice()).unwrap();
        prop_assert_eq!(decrypted.header.declared_size as usize, body.len());

        let mut expected = Vec::with_capacity(body.len());
        for (index, segment) in body.chunks(SEGMENT_LENGTH).enumerate() {
            expected.extend(decrypt_segment(&key, &salt, hash_alg, index as u32, segment).unwrap());
        }
        prop_assert_eq!(decrypted.plaintext, expected);
    }
}
