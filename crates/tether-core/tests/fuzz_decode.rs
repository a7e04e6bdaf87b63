use bytes::Bytes;
use rand::{thread_rng, Rng};
use tether_core::{Envelope, EnvelopeError, MessageKind, ENVELOPE_FIXED_HEADER_SIZE};

#[test]
fn fuzz_decode_envelope_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Envelope::decode(&data);
    }
}

fn sample() -> Envelope {
    let mut rng = thread_rng();
    let mut payload = vec![0u8; 48];
    rng.fill(&mut payload[..]);
    Envelope::new(MessageKind::Data, "alice", payload, 1_700_000_000_000)
}

/// Recompute the CRC trailer so a mutation gets past the checksum.
fn reseal(wire: &mut [u8]) {
    let body = wire.len() - 2;
    let mut state = crc16::State::<crc16::KERMIT>::new();
    state.update(&wire[..body]);
    let csum = state.get().to_be_bytes();
    wire[body..].copy_from_slice(&csum);
}

#[test]
fn single_byte_corruption_fails_checksum() {
    let wire = sample().encode().unwrap().to_vec();
    let mut rng = thread_rng();

    // Magic and version are checked before the CRC.
    for idx in 4..wire.len() - 2 {
        let mut mutated = wire.clone();
        mutated[idx] ^= rng.gen_range(1..=u8::MAX);
        assert_eq!(
            Envelope::decode(&mutated),
            Err(EnvelopeError::ChecksumMismatch),
            "corrupt byte {} slipped past the checksum",
            idx
        );
    }
}

#[test]
fn resealed_random_mutations_reach_field_checks() {
    let env = sample();
    let wire = env.encode().unwrap().to_vec();
    let mut rng = thread_rng();

    for _ in 0..5_000 {
        let mut mutated = wire.clone();
        for _ in 0..rng.gen_range(1..4) {
            let idx = rng.gen_range(4..mutated.len() - 2);
            mutated[idx] ^= rng.gen::<u8>();
        }
        reseal(&mut mutated);

        match Envelope::decode(&mutated) {
            Ok(decoded) => assert_eq!(decoded.encode().unwrap().as_ref(), &mutated[..]),
            Err(err) => assert_ne!(err, EnvelopeError::ChecksumMismatch),
        }
    }
}

#[test]
fn resealed_field_mutations_are_rejected_by_the_right_check() {
    let env = sample();
    let wire = env.encode().unwrap().to_vec();
    let peer_len = env.peer_id.len();
    let len_at = ENVELOPE_FIXED_HEADER_SIZE + peer_len;
    let payload_len = env.payload.len() as u32;

    let set_len = |len: u32| {
        move |w: &mut [u8]| w[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes())
    };
    let cases: Vec<(Box<dyn Fn(&mut [u8])>, EnvelopeError)> = vec![
        (Box::new(|w: &mut [u8]| w[4] = 0xee), EnvelopeError::UnknownKind(0xee)),
        (Box::new(|w: &mut [u8]| w[13] = 0), EnvelopeError::EmptyPeerId),
        (Box::new(|w: &mut [u8]| w[14] = 0xff), EnvelopeError::InvalidPeerId),
        (Box::new(set_len(payload_len + 1)), EnvelopeError::Truncated),
        (Box::new(set_len(payload_len - 1)), EnvelopeError::TrailingBytes(1)),
        (
            Box::new(set_len(u32::MAX)),
            EnvelopeError::PayloadTooLarge(u32::MAX as usize),
        ),
    ];

    for (mutate, expected) in cases {
        let mut mutated = wire.clone();
        mutate(&mut mutated[..]);
        reseal(&mut mutated);
        assert_eq!(Envelope::decode(&mutated), Err(expected));
    }
}

#[test]
fn truncated_valid_envelope_is_rejected() {
    let env = Envelope::new(
        MessageKind::Contact,
        "responder",
        Bytes::from_static(b"sealed contact card"),
        42,
    );
    let wire = env.encode().unwrap();

    for cut in 0..wire.len() {
        assert!(
            Envelope::decode(&wire[..cut]).is_err(),
            "prefix of {} bytes should not decode",
            cut
        );
    }
    assert_eq!(Envelope::decode(&wire).unwrap(), env);
}
