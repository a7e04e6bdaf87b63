//! Known-answer and round-trip checks over the crypto stack.

use anyhow::{ensure, Context, Result};

use tether_crypto::{
    calculate, KeyPair, NoiseSession, Role, SessionConfig, SessionError, MESSAGE_A_LEN,
    MESSAGE_B_LEN, MESSAGE_C_LEN,
};

pub fn run() -> Result<()> {
    let checks: [(&str, fn() -> Result<()>); 5] = [
        ("x25519 rfc7748 vector", x25519_vector),
        ("x25519 agreement", dh_agreement),
        ("noise xx handshake", handshake_sizes),
        ("tamper rejection", tamper_rejection),
        ("replay rejection", replay_rejection),
    ];

    for (name, check) in checks {
        check().with_context(|| format!("{} failed", name))?;
        println!("  ok  {}", name);
    }
    println!("all {} checks passed", checks.len());
    Ok(())
}

fn unhex32(s: &str) -> Result<[u8; 32]> {
    hex::decode(s)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
}

fn x25519_vector() -> Result<()> {
    // RFC 7748 section 5.2.
    let scalar = unhex32("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4")?;
    let u = unhex32("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c")?;
    let out = calculate(&scalar, &u)?;
    ensure!(
        hex::encode(*out) == "c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552",
        "unexpected output {}",
        hex::encode(*out)
    );
    Ok(())
}

fn dh_agreement() -> Result<()> {
    let a = KeyPair::generate();
    let b = KeyPair::generate();
    ensure!(
        *a.dh(b.public_key())? == *b.dh(a.public_key())?,
        "shared secrets differ"
    );
    Ok(())
}

fn established() -> Result<(NoiseSession, NoiseSession)> {
    let config = SessionConfig::default();
    let mut initiator = NoiseSession::new(Role::Initiator, KeyPair::generate(), &config)?;
    let mut responder = NoiseSession::new(Role::Responder, KeyPair::generate(), &config)?;

    let a = initiator.start_handshake()?;
    let b = responder
        .process_handshake_message(&a)?
        .context("responder produced no reply")?;
    let c = initiator
        .process_handshake_message(&b)?
        .context("initiator produced no reply")?;
    ensure!(
        responder.process_handshake_message(&c)?.is_none(),
        "unexpected fourth message"
    );
    ensure!(
        (a.len(), b.len(), c.len()) == (MESSAGE_A_LEN, MESSAGE_B_LEN, MESSAGE_C_LEN),
        "message sizes {} {} {}",
        a.len(),
        b.len(),
        c.len()
    );
    Ok((initiator, responder))
}

fn handshake_sizes() -> Result<()> {
    let (initiator, responder) = established()?;
    ensure!(
        initiator.handshake_hash() == responder.handshake_hash(),
        "handshake hashes differ"
    );
    ensure!(
        initiator.remote_static_public_key() == Some(responder.local_static_public_key()),
        "initiator learned the wrong static key"
    );

    let frame = initiator.encrypt(b"ping")?;
    ensure!(responder.decrypt(&frame)? == b"ping", "initiator -> responder");
    let frame = responder.encrypt(b"pong")?;
    ensure!(initiator.decrypt(&frame)? == b"pong", "responder -> initiator");
    Ok(())
}

fn tamper_rejection() -> Result<()> {
    let (initiator, responder) = established()?;
    let frame = initiator.encrypt(b"do not touch")?;
    for bit in [0usize, 8 * 8, frame.len() * 8 - 1] {
        let mut tampered = frame.clone();
        tampered[bit / 8] ^= 1 << (bit % 8);
        ensure!(
            responder.decrypt(&tampered).is_err(),
            "bit {} flip accepted",
            bit
        );
    }
    ensure!(responder.decrypt(&frame)? == b"do not touch", "untouched frame rejected");
    Ok(())
}

fn replay_rejection() -> Result<()> {
    let (initiator, responder) = established()?;
    let frame = initiator.encrypt(b"once")?;
    responder.decrypt(&frame)?;
    ensure!(
        matches!(responder.decrypt(&frame), Err(SessionError::Replay(0))),
        "replayed frame accepted"
    );
    Ok(())
}
