#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use typebus::{CodecConfig, EnvelopeCodec};

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    checksum: bool,
}

fuzz_target!(|input: FuzzInput| {
    let codec = EnvelopeCodec::new(CodecConfig {
        checksum: input.checksum,
        ..CodecConfig::default()
    });

    match codec.encode(&input.headers, &input.body) {
        Ok(bytes) => {
            let envelope = codec.decode(&bytes).expect("encoded envelope must decode");
            assert_eq!(envelope.headers, input.headers);
            assert_eq!(&envelope.body[..], &input.body[..]);
        }
        // Пустой ключ и превышение лимитов отклоняются при кодировании.
        Err(_) => {}
    }
});
