//! Two in-process peers, a link that delays, reorders and duplicates, and a
//! key store that only learns the peer key after a while.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_common::key_fingerprint;
use tether_core::{Envelope, MessageKind};
use tether_crypto::{KeyPair, Role, SessionConfig, SessionError};
use tether_link::{
    Collaborators, CoordinatorConfig, HandshakeCoordinator, LocalIdentity, ManagerError,
    MemoryIdentityStore, MemoryQueue, PeerKeyStore, SessionManager, Transport, TransportError,
};

#[derive(clap::Args, Debug)]
pub struct SimulateArgs {
    /// Data messages to send after the handshake
    #[arg(long, env = "TETHER_MESSAGES", default_value_t = 5)]
    pub messages: usize,

    /// Probability that the link delivers a message twice
    #[arg(long, env = "TETHER_DUPLICATE_RATE", default_value_t = 0.25)]
    pub duplicate_rate: f64,

    /// Upper bound on per-message link delay
    #[arg(long, env = "TETHER_MAX_DELAY_MS", default_value_t = 20)]
    pub max_delay_ms: u64,

    /// How long the key store hides the peer key
    #[arg(long, env = "TETHER_KEY_DELAY_MS", default_value_t = 120)]
    pub key_delay_ms: u64,

    /// Replay window for the data phase (1..=128)
    #[arg(long, env = "TETHER_REPLAY_WINDOW", default_value_t = 1)]
    pub replay_window: u64,

    /// Static key file for alice, as written by `tether keygen --out`
    #[arg(long, env = "TETHER_KEY_FILE")]
    pub key: Option<PathBuf>,

    /// Seed for the link's randomness
    #[arg(long, env = "TETHER_SEED")]
    pub seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    handshake_hash: String,
    initiator_contact: String,
    responder_contact: String,
    initiator_key_lookups: u32,
    responder_key_lookups: u32,
    link_messages: u64,
    link_duplicates: u64,
    data_messages: usize,
    replay_rejected: bool,
    elapsed_ms: u64,
}

/// One direction of the link.
struct JitterLink {
    tx: mpsc::Sender<Bytes>,
    duplicate_rate: f64,
    max_delay_ms: u64,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
    duplicates: AtomicU64,
}

impl JitterLink {
    fn new(tx: mpsc::Sender<Bytes>, args: &SimulateArgs, seed: u64) -> Self {
        Self {
            tx,
            duplicate_rate: args.duplicate_rate,
            max_delay_ms: args.max_delay_ms,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            sent: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for JitterLink {
    async fn send_message(&self, message: Bytes) -> Result<(), TransportError> {
        if self.tx.is_closed() {
            return Err(TransportError::Closed);
        }

        let delays: Vec<u64> = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let copies = if rng.gen_bool(self.duplicate_rate) { 2 } else { 1 };
            (0..copies)
                .map(|_| rng.gen_range(0..=self.max_delay_ms))
                .collect()
        };

        self.sent.fetch_add(1, Ordering::Relaxed);
        if delays.len() > 1 {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        for delay in delays {
            let tx = self.tx.clone();
            let message = message.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if tx.send(message).await.is_err() {
                    debug!("receiver gone, dropping delivery");
                }
            });
        }
        Ok(())
    }
}

/// Reports no key until `visible_at`.
struct DelayedKeys {
    sessions: Arc<SessionManager>,
    visible_at: Instant,
    lookups: AtomicU32,
}

#[async_trait]
impl PeerKeyStore for DelayedKeys {
    async fn static_key(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if Instant::now() < self.visible_at {
            return None;
        }
        self.sessions.static_key(peer_id).await
    }
}

struct Peer {
    coordinator: HandshakeCoordinator,
    sessions: Arc<SessionManager>,
    keys: Arc<DelayedKeys>,
    link: Arc<JitterLink>,
}

fn peer(
    role: Role,
    id: &str,
    remote: &str,
    static_key: KeyPair,
    link: JitterLink,
    args: &SimulateArgs,
) -> Peer {
    let session_config = SessionConfig {
        replay_window: args.replay_window,
        ..SessionConfig::default()
    };
    let sessions = Arc::new(SessionManager::new(static_key, session_config));
    let keys = Arc::new(DelayedKeys {
        sessions: Arc::clone(&sessions),
        visible_at: Instant::now() + Duration::from_millis(args.key_delay_ms),
        lookups: AtomicU32::new(0),
    });
    let link = Arc::new(link);

    let collaborators = Collaborators {
        transport: Arc::clone(&link) as _,
        key_store: Arc::clone(&keys) as _,
        identities: Arc::new(MemoryIdentityStore::new()),
        queue: Arc::new(MemoryQueue::new()),
    };
    let config = CoordinatorConfig {
        expected_peer_id: Some(remote.to_string()),
        ..CoordinatorConfig::default()
    };

    let name = id.to_string();
    let coordinator = HandshakeCoordinator::new(
        role,
        LocalIdentity::new(id, format!("{} (simulated)", id)),
        config,
        Arc::clone(&sessions),
        collaborators,
        Box::new(move |result| match result {
            Ok(contact) => info!(node = %name, peer = %contact.peer_id, "completion reported"),
            Err(err) => warn!(node = %name, error = %err, "failure reported"),
        }),
    );

    Peer {
        coordinator,
        sessions,
        keys,
        link,
    }
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&args.duplicate_rate),
        "duplicate rate must be between 0 and 1"
    );
    ensure!(
        (1..=128).contains(&args.replay_window),
        "replay window must be between 1 and 128"
    );

    let seed = args.seed.unwrap_or_else(rand::random);
    info!(seed, "starting simulation");
    let started = Instant::now();

    let (to_alice, mut alice_rx) = mpsc::channel(64);
    let (to_bob, mut bob_rx) = mpsc::channel(64);
    let alice_key = match &args.key {
        Some(path) => crate::keygen::load_key_file(path)?,
        None => KeyPair::generate(),
    };
    let mut alice = peer(
        Role::Initiator,
        "alice",
        "bob",
        alice_key,
        JitterLink::new(to_bob, &args, seed),
        &args,
    );
    let mut bob = peer(
        Role::Responder,
        "bob",
        "alice",
        KeyPair::generate(),
        JitterLink::new(to_alice, &args, seed.wrapping_add(1)),
        &args,
    );

    let (a, b) = tokio::join!(
        alice.coordinator.run(&mut alice_rx),
        bob.coordinator.run(&mut bob_rx)
    );
    let a = a.context("initiator handshake")?;
    let b = b.context("responder handshake")?;
    ensure!(a.handshake_hash == b.handshake_hash, "handshake hashes differ");

    for i in 0..args.messages {
        let text = format!("message {} from alice", i);
        let frame = alice.sessions.encrypt_for("bob", text.as_bytes()).await?;
        let raw = Envelope::new(MessageKind::Data, "alice", frame, tether_common::now_millis())
            .encode()?;

        let envelope = Envelope::decode(&raw)?;
        let plaintext = bob.sessions.decrypt_from(&envelope.peer_id, &envelope.payload).await?;
        ensure!(plaintext == text.as_bytes(), "message {} corrupted", i);
    }

    let frame = alice.sessions.encrypt_for("bob", b"once").await?;
    bob.sessions.decrypt_from("alice", &frame).await?;
    let replay_rejected = matches!(
        bob.sessions.decrypt_from("alice", &frame).await,
        Err(ManagerError::Session(SessionError::Replay(_)))
    );

    let report = Report {
        handshake_hash: hex::encode(a.handshake_hash),
        initiator_contact: format!("{} ({})", a.display_name, key_fingerprint(&a.static_public_key)),
        responder_contact: format!("{} ({})", b.display_name, key_fingerprint(&b.static_public_key)),
        initiator_key_lookups: alice.keys.lookups.load(Ordering::Relaxed),
        responder_key_lookups: bob.keys.lookups.load(Ordering::Relaxed),
        link_messages: alice.link.sent.load(Ordering::Relaxed) + bob.link.sent.load(Ordering::Relaxed),
        link_duplicates: alice.link.duplicates.load(Ordering::Relaxed)
            + bob.link.duplicates.load(Ordering::Relaxed),
        data_messages: args.messages,
        replay_rejected,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    alice.sessions.shutdown().await;
    bob.sessions.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("handshake hash:   {}", report.handshake_hash);
        println!("alice sees:       {}", report.initiator_contact);
        println!("bob sees:         {}", report.responder_contact);
        println!(
            "key lookups:      {} (initiator), {} (responder)",
            report.initiator_key_lookups, report.responder_key_lookups
        );
        println!(
            "link messages:    {} ({} duplicated)",
            report.link_messages, report.link_duplicates
        );
        println!("data messages:    {}", report.data_messages);
        println!("replay rejected:  {}", report.replay_rejected);
        println!("elapsed:          {} ms", report.elapsed_ms);
    }

    ensure!(report.replay_rejected, "replayed frame was accepted");
    Ok(())
}
