//! Transport security properties of established sessions.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use tether_crypto::{
    CryptoError, KeyPair, NoiseSession, Role, SessionConfig, SessionError, FRAME_OVERHEAD,
};

fn pair_with(config: SessionConfig) -> (NoiseSession, NoiseSession) {
    let mut i = NoiseSession::new(Role::Initiator, KeyPair::generate(), &config).unwrap();
    let mut r = NoiseSession::new(Role::Responder, KeyPair::generate(), &config).unwrap();
    let a = i.start_handshake().unwrap();
    let b = r.process_handshake_message(&a).unwrap().unwrap();
    let c = i.process_handshake_message(&b).unwrap().unwrap();
    r.process_handshake_message(&c).unwrap();
    (i, r)
}

fn pair() -> (NoiseSession, NoiseSession) {
    pair_with(SessionConfig::default())
}

#[test]
fn test_replay_rejected() {
    let (i, r) = pair();
    let framed = i.encrypt(b"once").unwrap();
    assert_eq!(r.decrypt(&framed).unwrap(), b"once");
    assert_eq!(r.decrypt(&framed).unwrap_err(), SessionError::Replay(0));
}

#[test]
fn test_consumed_nonce_rejected() {
    let (i, r) = pair();
    let first = i.encrypt(b"first").unwrap();
    let second = i.encrypt(b"second").unwrap();
    assert!(r.decrypt(&second).is_ok());
    // Strict policy: nonce 0 is below the highest accepted nonce.
    assert_eq!(r.decrypt(&first).unwrap_err(), SessionError::Replay(0));
}

#[test]
fn test_every_bit_flip_rejected() {
    let (i, r) = pair();
    let framed = i.encrypt(b"integrity matters").unwrap();

    for byte in 0..framed.len() {
        for bit in 0..8 {
            let mut tampered = framed.clone();
            tampered[byte] ^= 1 << bit;
            assert!(
                r.decrypt(&tampered).is_err(),
                "flip of bit {} in byte {} was accepted",
                bit,
                byte
            );
        }
    }
    // None of the forgeries consumed the nonce.
    assert_eq!(r.decrypt(&framed).unwrap(), b"integrity matters");
}

#[test]
fn test_tampered_ciphertext_is_authentication_failure() {
    let (i, r) = pair();
    let mut framed = i.encrypt(b"payload").unwrap();
    let last = framed.len() - 1;
    framed[last] ^= 0xff;
    assert_eq!(
        r.decrypt(&framed).unwrap_err(),
        SessionError::Crypto(CryptoError::AuthenticationFailed)
    );
}

#[test]
fn test_empty_and_large_plaintext() {
    let (i, r) = pair();

    let framed = i.encrypt(&[]).unwrap();
    assert_eq!(framed.len(), FRAME_OVERHEAD);
    assert!(r.decrypt(&framed).unwrap().is_empty());

    let large: Vec<u8> = (0..50 * 1024).map(|n| (n % 251) as u8).collect();
    let framed = i.encrypt(&large).unwrap();
    assert_eq!(framed.len(), large.len() + FRAME_OVERHEAD);
    assert_eq!(r.decrypt(&framed).unwrap(), large);
}

#[test]
fn test_identical_plaintexts_differ() {
    let (i, _r) = pair();
    let a = i.encrypt(b"same").unwrap();
    let b = i.encrypt(b"same").unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_bidirectional_independent_counters() {
    let (i, r) = pair();
    for n in 0..10u64 {
        let msg = format!("i->r {}", n);
        assert_eq!(r.decrypt(&i.encrypt(msg.as_bytes()).unwrap()).unwrap(), msg.as_bytes());
    }
    let back = r.encrypt(b"r->i").unwrap();
    assert_eq!(&back[..8], &0u64.to_be_bytes());
    assert_eq!(i.decrypt(&back).unwrap(), b"r->i");
}

#[test]
fn test_wrong_direction_fails() {
    let (i, _r) = pair();
    let framed = i.encrypt(b"to responder").unwrap();
    // The initiator's receive key is not its send key.
    assert!(i.decrypt(&framed).is_err());
}

#[test]
fn test_lifecycle_errors() {
    let config = SessionConfig::default();
    let mut i = NoiseSession::new(Role::Initiator, KeyPair::generate(), &config).unwrap();
    assert_eq!(i.encrypt(b"x").unwrap_err(), SessionError::NotEstablished);
    i.start_handshake().unwrap();
    assert_eq!(i.encrypt(b"x").unwrap_err(), SessionError::NotEstablished);
    assert_eq!(i.decrypt(&[0u8; 32]).unwrap_err(), SessionError::NotEstablished);

    let (mut a, b) = pair();
    a.destroy();
    assert_eq!(a.encrypt(b"x").unwrap_err(), SessionError::Destroyed);
    assert_eq!(
        a.decrypt(&b.encrypt(b"y").unwrap()).unwrap_err(),
        SessionError::Destroyed
    );
    assert_eq!(a.start_handshake().unwrap_err(), SessionError::Destroyed);
}

#[test]
fn test_concurrent_encrypt_never_reuses_nonce() {
    let (i, r) = pair();
    let i = Arc::new(i);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let session = Arc::clone(&i);
            thread::spawn(move || {
                (0..64)
                    .map(|_| session.encrypt(b"concurrent").unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut frames = Vec::new();
    for handle in handles {
        frames.extend(handle.join().unwrap());
    }

    let nonces: HashSet<u64> = frames
        .iter()
        .map(|f| u64::from_be_bytes(f[..8].try_into().unwrap()))
        .collect();
    assert_eq!(nonces.len(), 8 * 64);
    assert_eq!(i.next_send_nonce(), Some(8 * 64));

    // Every frame decrypts once the receiver sees them in nonce order.
    frames.sort_by_key(|f| u64::from_be_bytes(f[..8].try_into().unwrap()));
    for frame in &frames {
        assert_eq!(r.decrypt(frame).unwrap(), b"concurrent");
    }
}

#[test]
fn test_sliding_window_tolerates_reordering() {
    let (i, r) = pair_with(SessionConfig {
        replay_window: 16,
        ..SessionConfig::default()
    });

    let frames: Vec<_> = (0..6u8).map(|n| i.encrypt(&[n]).unwrap()).collect();
    for idx in [2usize, 0, 5, 1, 4, 3] {
        assert_eq!(r.decrypt(&frames[idx]).unwrap(), vec![idx as u8]);
    }
    for frame in &frames {
        assert!(matches!(r.decrypt(frame), Err(SessionError::Replay(_))));
    }
    assert_eq!(r.highest_received_nonce(), Some(5));
}

#[test]
fn test_sliding_window_drops_too_old() {
    let (i, r) = pair_with(SessionConfig {
        replay_window: 4,
        ..SessionConfig::default()
    });

    let frames: Vec<_> = (0..8u8).map(|n| i.encrypt(&[n]).unwrap()).collect();
    r.decrypt(&frames[7]).unwrap();
    assert!(r.decrypt(&frames[4]).is_ok());
    assert_eq!(r.decrypt(&frames[3]).unwrap_err(), SessionError::Replay(3));
}
