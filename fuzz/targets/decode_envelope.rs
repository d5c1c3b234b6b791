#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use typebus::{CodecConfig, EnvelopeCodec};

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    data: Vec<u8>,
    max_headers: u8,
    max_body_bytes: u16,
}

fuzz_target!(|input: FuzzInput| {
    let codec = EnvelopeCodec::new(CodecConfig {
        max_headers: input.max_headers as usize,
        max_body_bytes: input.max_body_bytes as usize,
        checksum: true,
    });

    // Декодер не должен паниковать ни на каких входных данных.
    if let Ok(envelope) = codec.decode(&input.data) {
        assert!(envelope.headers.len() <= input.max_headers as usize);
        assert!(envelope.body.len() <= input.max_body_bytes as usize);

        // Пустой ключ заголовка декодер пропускает, а кодер отклоняет.
        if let Ok(again) = codec.encode_envelope(&envelope) {
            assert_eq!(codec.decode(&again).unwrap(), envelope);
        }
    }
});
