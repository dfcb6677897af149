#![no_main]

use formula_agile_crypto::{decrypt_package, AgileDecryptor, DecryptOptions, HashAlgorithm};
use libfuzzer_sys::fuzz_target;

const MAX_INPUT_BYTES: usize = 64 * 1024;

const DESCRIPTOR: &[u8] = b"\x04\x00\x04\x00\x40\x00\x00\x00<encryption \
xmlns=\"http://schemas.microsoft.com/office/2006/encryption\" \
xmlns:p=\"http://schemas.microsoft.com/office/2006/keyEncryptor/password\">\
<keyData saltValue=\"AAECAwQFBgcICQoLDA0ODw==\" hashAlgorithm=\"SHA256\"/>\
<keyEncryptors><keyEncryptor uri=\"http://schemas.microsoft.com/office/2006/keyEncryptor/password\">\
<p:encryptedKey spinCount=\"0\" saltValue=\"AAECAwQFBgcICQoLDA0ODw==\" hashAlgorithm=\"SHA1\" \
keyBits=\"128\" encryptedKeyValue=\"AAECAwQFBgcICQoLDA0ODw==\"/>\
</keyEncryptor></keyEncryptors></encryption>";

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let data = &data[..data.len().min(MAX_INPUT_BYTES)];

    // First byte picks the key size and hash; the rest is the EncryptedPackage stream.
    let selector = data[0];
    let key = vec![data[1]; [16usize, 24, 32, 20][usize::from(selector & 3)]];
    let hash_alg = match (selector >> 2) & 3 {
        0 => HashAlgorithm::Sha1,
        1 => HashAlgorithm::Sha256,
        2 => HashAlgorithm::Sha384,
        _ => HashAlgorithm::Sha512,
    };
    let package = &data[2..];

    let _ = decrypt_package(&key, &[selector; 16], hash_alg, package);

    let Ok(mut decryptor) = AgileDecryptor::from_encryption_info(DESCRIPTOR) else {
        return;
    };
    if decryptor.load_password("fuzz").is_err() {
        return;
    }
    for streaming in [false, true] {
        decryptor.set_options(DecryptOptions {
            truncate_to_declared_size: selector & 0x10 != 0,
            streaming,
            ..DecryptOptions::default()
        });
        let mut sink = Vec::new();
        let _ = decryptor.decrypt_to(package, &mut sink);
    }
});
