use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{instrument, warn};

use dns_types::protocol::deserialise::deserialise_message;
use dns_types::protocol::serialise::serialise_message;
use dns_types::protocol::types::{Message, Question, MAX_UDP_MESSAGE_LEN};

use crate::context::Context;

/// Binds a fresh local socket and connects it to `addr`.  Connecting
/// a UDP socket doesn't open anything on the wire, it just filters
/// `recv` to datagrams from that peer and lets `send`/`recv` be used
/// instead of `send_to`/`recv_from`.
type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<UdpSocket>> + Send>>;
pub type DialFn = Arc<dyn Fn(SocketAddr) -> DialFuture + Send + Sync>;

pub fn default_dial() -> DialFn {
    Arc::new(|addr: SocketAddr| -> DialFuture {
        Box::pin(async move {
            let local: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(addr).await?;
            Ok(socket)
        })
    })
}

/// Queries a fixed list of upstream DNS servers over UDP, per
/// spec.md §4.5.  Stateless across queries: every call allocates and
/// releases its own sockets, trading a little per-query overhead for
/// not having to reason about a shared connection pool's failure
/// modes.
#[derive(Clone)]
pub struct Forwarder {
    servers: Vec<SocketAddr>,
    default_timeout: Duration,
    parallel: bool,
    dial: DialFn,
}

impl Forwarder {
    /// # Panics
    /// If `servers` is empty.
    pub fn new(servers: Vec<SocketAddr>, default_timeout: Duration, parallel: bool) -> Self {
        assert!(!servers.is_empty(), "forwarder requires at least one upstream");
        Self {
            servers,
            default_timeout,
            parallel,
            dial: default_dial(),
        }
    }

    /// Override the dial function, e.g. to point at an in-process
    /// fake server in tests.
    pub fn with_dial(mut self, dial: DialFn) -> Self {
        self.dial = dial;
        self
    }

    #[instrument(skip(self, ctx), fields(question = %question))]
    pub async fn resolve(
        &self,
        ctx: &Context,
        question: &Question,
        now: Instant,
    ) -> Result<Message, Error> {
        let ctx = ctx.or_deadline(now + self.default_timeout);
        let deadline = ctx.deadline().expect("deadline just attached if absent");
        let query = Message::from_question(question.id, question.clone());
        let query_bytes = serialise_message(&query).map_err(|_| Error::EncodeFailed)?;

        if self.parallel {
            self.resolve_parallel(&query_bytes, question.id, deadline)
                .await
        } else {
            self.resolve_serial(&query_bytes, question.id, deadline)
                .await
        }
    }

    async fn resolve_serial(
        &self,
        query_bytes: &[u8],
        expected_id: u16,
        deadline: Instant,
    ) -> Result<Message, Error> {
        let mut failures = 0usize;

        for server in &self.servers {
            match query_one(self.dial.clone(), *server, query_bytes, expected_id, deadline).await {
                Ok(message) => return Ok(message),
                Err(err) => {
                    warn!(%server, error = %err, "upstream query failed");
                    failures += 1;
                }
            }
        }

        Err(Error::AllServersFailed { count: failures })
    }

    async fn resolve_parallel(
        &self,
        query_bytes: &[u8],
        expected_id: u16,
        deadline: Instant,
    ) -> Result<Message, Error> {
        let mut tasks = JoinSet::new();

        for server in self.servers.clone() {
            let dial = self.dial.clone();
            let query_bytes = query_bytes.to_vec();
            tasks.spawn(async move {
                query_one(dial, server, &query_bytes, expected_id, deadline).await
            });
        }

        let wait = async {
            let mut failures = 0usize;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(message)) => return Ok(message),
                    Ok(Err(_)) | Err(_) => failures += 1,
                }
            }
            Err(Error::AllServersFailed { count: failures })
        };

        // dropping `tasks` (which happens when this function returns,
        // whichever branch fires) aborts every not-yet-finished
        // sibling, including the ones that lost the race below.
        match timeout(deadline.saturating_duration_since(Instant::now()), wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

async fn query_one(
    dial: DialFn,
    server: SocketAddr,
    query_bytes: &[u8],
    expected_id: u16,
    deadline: Instant,
) -> Result<Message, Error> {
    let remaining = deadline.saturating_duration_since(Instant::now());

    let socket = timeout(remaining, dial(server))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::FailedToConnect)?;

    timeout(remaining, socket.send(query_bytes))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::WriteFailed)?;

    let mut buf = [0u8; MAX_UDP_MESSAGE_LEN];
    let len = timeout(remaining, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::ReadFailed)?;

    let message = deserialise_message(&buf[..len]).map_err(|_| Error::DecodeFailed)?;

    if message.header.id != expected_id {
        return Err(Error::DecodeFailed);
    }

    Ok(message)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    FailedToConnect,
    EncodeFailed,
    WriteFailed,
    ReadFailed,
    DecodeFailed,
    Timeout,
    AllServersFailed { count: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::FailedToConnect => write!(f, "failed to connect to upstream"),
            Error::EncodeFailed => write!(f, "failed to encode query"),
            Error::WriteFailed => write!(f, "failed to write query to upstream"),
            Error::ReadFailed => write!(f, "failed to read reply from upstream"),
            Error::DecodeFailed => write!(f, "failed to decode reply from upstream"),
            Error::Timeout => write!(f, "upstream resolution timed out"),
            Error::AllServersFailed { count } => write!(f, "all {count} upstream servers failed"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use dns_types::protocol::types::{QueryType, RecordType, ResourceRecord};
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket as StdUdpSocket;

    /// Spawns an in-process fake upstream that answers every query
    /// with a fixed A record, and returns its address.
    async fn fake_server(answer: ResourceRecord) -> SocketAddr {
        let socket = StdUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = deserialise_message(&buf[..len]) else {
                    continue;
                };
                let mut response = query.make_response();
                response.answers.push(answer.clone());
                let bytes = serialise_message(&response).unwrap();
                let _ = socket.send_to(&bytes, peer).await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn serial_resolve_succeeds_against_fake_server() {
        let answer = a_record("example.com.", Ipv4Addr::new(9, 9, 9, 9));
        let addr = fake_server(answer.clone()).await;

        let forwarder = Forwarder::new(vec![addr], Duration::from_secs(1), false);
        let q = question("example.com.", QueryType::Record(RecordType::A));

        let response = forwarder
            .resolve(&Context::background(), &q, Instant::now())
            .await
            .unwrap();

        assert_eq!(response.answers, vec![answer]);
    }

    #[tokio::test]
    async fn serial_resolve_fails_over_to_second_server() {
        let answer = a_record("example.com.", Ipv4Addr::new(1, 1, 1, 1));
        let good = fake_server(answer.clone()).await;
        let bad: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let forwarder = Forwarder::new(vec![bad, good], Duration::from_millis(200), false);
        let q = question("example.com.", QueryType::Record(RecordType::A));

        let response = forwarder
            .resolve(&Context::background(), &q, Instant::now())
            .await
            .unwrap();

        assert_eq!(response.answers, vec![answer]);
    }

    #[tokio::test]
    async fn all_servers_failing_reports_aggregate_error() {
        let bad1: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let bad2: SocketAddr = "127.0.0.1:2".parse().unwrap();

        let forwarder = Forwarder::new(vec![bad1, bad2], Duration::from_millis(200), false);
        let q = question("example.com.", QueryType::Record(RecordType::A));

        let err = forwarder
            .resolve(&Context::background(), &q, Instant::now())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AllServersFailed { .. } | Error::FailedToConnect));
    }

    #[tokio::test]
    async fn parallel_resolve_returns_first_success() {
        let answer = a_record("example.com.", Ipv4Addr::new(2, 2, 2, 2));
        let addr = fake_server(answer.clone()).await;

        let forwarder = Forwarder::new(vec![addr], Duration::from_secs(1), true);
        let q = question("example.com.", QueryType::Record(RecordType::A));

        let response = forwarder
            .resolve(&Context::background(), &q, Instant::now())
            .await
            .unwrap();

        assert_eq!(response.answers, vec![answer]);
    }
}
