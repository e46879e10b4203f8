//! Tokio session
//!
//! `Session` owns the UDP socket and runs a `Dispersy` on a single event
//! loop. Received datagrams, walker steps, sync rounds, maintenance and
//! commands from other tasks are handled one at a time; after each event
//! the outbox is flushed to the socket.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::core::Dispersy;
use super::error::DispersyError;

/// Largest UDP payload we read
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Commands queued before the loop applies backpressure
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Shortest timer period
const MIN_PERIOD: Duration = Duration::from_millis(100);

type Command = Box<dyn FnOnce(&mut Dispersy, Instant) + Send>;

/// A running Dispersy instance bound to a UDP socket
pub struct Session {
    commands: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    local_addr: SocketAddrV4,
    task: Mutex<Option<JoinHandle<Result<(), DispersyError>>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Bind the configured port on all interfaces and start.
    pub async fn start(dispersy: Dispersy) -> Result<Self, DispersyError> {
        let port = dispersy.config().port;
        Self::bind(dispersy, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await
    }

    /// Bind `address` and start.
    ///
    /// Communities marked auto-load are loaded before the first packet is
    /// read, so every classification must already be registered.
    pub async fn bind(mut dispersy: Dispersy, address: SocketAddrV4) -> Result<Self, DispersyError> {
        let socket = UdpSocket::bind(address).await?;
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(local) => local,
            SocketAddr::V6(local) => {
                return Err(DispersyError::Io(format!("bound to IPv6 address {}", local)));
            }
        };
        let lan_address = if local_addr.ip().is_unspecified() {
            SocketAddrV4::new(guess_lan_ip(), local_addr.port())
        } else {
            local_addr
        };
        dispersy.set_lan_address(lan_address);

        let loaded = dispersy.load_communities(Instant::now())?;
        info!(
            %local_addr,
            %lan_address,
            member = %hex::encode(dispersy.my_member().member.mid),
            communities = loaded.len(),
            "Session started"
        );

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(run(dispersy, socket, command_rx, shutdown_rx));

        Ok(Self {
            commands,
            shutdown_tx,
            local_addr,
            task: Mutex::new(Some(task)),
        })
    }

    /// The address the socket is bound to
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Run `f` on the event loop and return its result.
    ///
    /// Packets queued by `f` are flushed before the next event.
    pub async fn call<F, R>(&self, f: F) -> Result<R, DispersyError>
    where
        F: FnOnce(&mut Dispersy, Instant) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command: Command = Box::new(move |dispersy, now| {
            let _ = reply_tx.send(f(dispersy, now));
        });
        self.commands
            .send(command)
            .await
            .map_err(|_| DispersyError::NotRunning)?;
        reply_rx.await.map_err(|_| DispersyError::NotRunning)
    }

    /// Whether the event loop is still running
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the event loop, flush routing and wait for it to exit.
    pub async fn stop(&self) -> Result<(), DispersyError> {
        let Some(task) = self.task.lock().await.take() else {
            return Err(DispersyError::NotRunning);
        };
        let _ = self.shutdown_tx.send(()).await;
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(DispersyError::Io(format!("event loop panicked: {}", e))),
        };
        info!(local_addr = %self.local_addr, "Session stopped");
        result
    }
}

/// The event loop. Returns once shut down or every `Session` handle is gone.
async fn run(
    mut dispersy: Dispersy,
    socket: UdpSocket,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<(), DispersyError> {
    let config = dispersy.config().clone();
    let start = tokio::time::Instant::now();
    let mut walker = interval_at(start + config.walker_initial_delay(), period(config.walker_interval()));
    let mut sync = interval_at(start + period(config.sync_interval()), period(config.sync_interval()));
    let mut maintenance = interval(period(config.maintenance_interval()));
    for timer in [&mut walker, &mut sync, &mut maintenance] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, SocketAddr::V4(source))) => {
                    dispersy.on_packet(source, &buf[..len], Instant::now());
                }
                Ok((_, source)) => {
                    trace!(%source, "ignoring IPv6 datagram");
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here
                    debug!(error = %e, "receive failed");
                }
            },
            _ = walker.tick() => dispersy.walker_step(Instant::now()),
            _ = sync.tick() => dispersy.sync_round(Instant::now()),
            _ = maintenance.tick() => dispersy.maintenance(Instant::now()),
            command = commands.recv() => match command {
                Some(command) => command(&mut dispersy, Instant::now()),
                None => {
                    debug!("all session handles dropped");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("shutdown requested");
                break;
            }
        }
        flush(&socket, &mut dispersy).await;
    }

    let result = dispersy.shutdown(Instant::now());
    flush(&socket, &mut dispersy).await;
    result
}

/// Timer period; tokio rejects zero.
fn period(configured: Duration) -> Duration {
    configured.max(MIN_PERIOD)
}

async fn flush(socket: &UdpSocket, dispersy: &mut Dispersy) {
    for outgoing in dispersy.take_outgoing() {
        if let Err(e) = socket.send_to(&outgoing.packet, SocketAddr::V4(outgoing.address)).await {
            debug!(address = %outgoing.address, error = %e, "send failed");
        }
    }
}

/// IPv4 address of the interface holding the default route.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn guess_lan_ip() -> Ipv4Addr {
    let routed = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).map(|_| socket))
        .and_then(|socket| socket.local_addr());
    match routed {
        Ok(SocketAddr::V4(local)) if !local.ip().is_unspecified() => *local.ip(),
        Ok(_) => Ipv4Addr::LOCALHOST,
        Err(e) => {
            warn!(error = %e, "no route to guess the LAN address, using loopback");
            Ipv4Addr::LOCALHOST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communities::simple::SimpleCommunity;
    use crate::data::start::start_memory_db;
    use crate::data::sync::count_all_packets;
    use crate::protocol::config::DispersyConfig;

    fn dispersy(seed: u64) -> Dispersy {
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(seed)).unwrap();
        d.register_classification(SimpleCommunity::CLASSIFICATION, SimpleCommunity::factory());
        d
    }

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    #[tokio::test]
    async fn test_call_and_stop() {
        let session = Session::bind(dispersy(1), loopback()).await.unwrap();
        assert_ne!(session.local_addr().port(), 0);
        let lan = session.call(|d, _| d.lan_address()).await.unwrap();
        assert_eq!(lan, session.local_addr());
        assert!(session.is_running().await);

        session.stop().await.unwrap();
        assert!(!session.is_running().await);
        assert!(matches!(session.call(|_, _| ()).await, Err(DispersyError::NotRunning)));
        assert!(matches!(session.stop().await, Err(DispersyError::NotRunning)));
    }

    #[tokio::test]
    async fn test_two_sessions_sync_over_udp() {
        let a = Session::bind(dispersy(1), loopback()).await.unwrap();
        let b = Session::bind(dispersy(2), loopback()).await.unwrap();

        let (cid, master) = a
            .call(|d, now| {
                let cid = d.create_community(Box::new(SimpleCommunity::new()), now)?;
                d.create_value_message(&cid, "text", SimpleCommunity::text_value("over udp"), now)?;
                let master = d.community(&cid).map(|c| c.master().public_key.clone());
                Ok::<_, DispersyError>((cid, master))
            })
            .await
            .unwrap()
            .unwrap();
        let master = master.unwrap();
        b.call(move |d, now| d.join_community(&master, Box::new(SimpleCommunity::new()), now))
            .await
            .unwrap()
            .unwrap();

        let target = a.local_addr();
        b.call(move |d, now| d.walk_to(&cid, target, now)).await.unwrap().unwrap();

        let mut texts = Vec::new();
        for _ in 0..100 {
            texts = b
                .call(move |d, _| {
                    d.community(&cid)
                        .and_then(|c| c.hooks_as::<SimpleCommunity>())
                        .map(|hooks| hooks.texts().to_vec())
                        .unwrap_or_default()
                })
                .await
                .unwrap();
            if !texts.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(texts, vec!["over udp".to_string()]);

        let stored = b
            .call(move |d, _| {
                let id = d.community(&cid).map(|c| c.database_id()).unwrap_or_default();
                count_all_packets(d.connection(), id)
            })
            .await
            .unwrap()
            .unwrap();
        // B's identity, A's authorize, A's identity and the text
        assert_eq!(stored, 4);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
