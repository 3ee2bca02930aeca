use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, info_span, warn, Instrument};

use dns_resolver::context::Context;
use dns_types::protocol::deserialise::deserialise_message;
use dns_types::protocol::serialise::serialise_message;
use dns_types::protocol::types::{Message, Question, MAX_UDP_MESSAGE_LEN};

/// How long `stop()` waits for in-flight handler tasks before giving
/// up on them, per spec.md §4.6 ("tens of seconds").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// `Unstarted → Running → Stopped`, spec.md §4.6. There's no explicit
/// state field: `Unstarted` is "never called `run`", `Running` is
/// "inside `run`'s receive loop", `Stopped` is "`run` has returned".
/// The states are distinguished by which method you're allowed to
/// call, not by inspectable data.
pub struct UdpTransport {
    addr: SocketAddr,
}

impl UdpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Binds the listening socket and runs the receive loop until
    /// `ctx` is cancelled. Each datagram is dispatched to its own
    /// task so a slow query never blocks the next `recv_from`.
    pub async fn run<H, Fut>(&self, ctx: Context, handler: H) -> std::io::Result<()>
    where
        H: Fn(Context, Question, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        let socket = Arc::new(UdpSocket::bind(self.addr).await?);
        let handler = Arc::new(handler);
        let mut tasks = JoinSet::new();
        let mut buf = vec![0u8; MAX_UDP_MESSAGE_LEN];

        info!(addr = %self.addr, "DNS UDP transport running");

        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(%err, "UDP receive error");
                            continue;
                        }
                    };
                    let datagram = buf[..len].to_vec();
                    let socket = socket.clone();
                    let handler = handler.clone();
                    let handler_ctx = ctx.child();
                    tasks.spawn(async move {
                        handle_datagram(handler_ctx, handler.as_ref(), &socket, peer, &datagram).await;
                    });
                }
            }
        }

        self.stop(tasks).await;
        info!(addr = %self.addr, "DNS UDP transport stopped");
        Ok(())
    }

    async fn stop(&self, mut tasks: JoinSet<()>) {
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace window elapsed with handlers still running, aborting them");
            tasks.abort_all();
        }
    }
}

async fn handle_datagram<H, Fut>(
    ctx: Context,
    handler: &H,
    socket: &UdpSocket,
    peer: SocketAddr,
    datagram: &[u8],
) where
    H: Fn(Context, Question, SocketAddr) -> Fut,
    Fut: Future<Output = Message>,
{
    let query = match deserialise_message(datagram) {
        Ok(message) => message,
        Err(err) => {
            warn!(%peer, %err, "dropping malformed datagram");
            return;
        }
    };

    let [question] = query.questions.as_slice() else {
        warn!(%peer, qdcount = query.questions.len(), "dropping datagram with unsupported question count");
        return;
    };

    let span = info_span!("query", id = question.id, %peer);
    let response = handler(ctx, question.clone(), peer)
        .instrument(span)
        .await;

    let bytes = match serialise_message(&response) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%peer, %err, "failed to encode response");
            return;
        }
    };

    let bytes = truncate_if_needed(response, bytes);

    if let Err(err) = socket.send_to(&bytes, peer).await {
        warn!(%peer, %err, "failed to send response");
    }
}

/// Responses must fit in 512 bytes (spec.md §6). When the encoded
/// message is too large, drop records from the end of the answer
/// section and set TC=1, re-encoding until it fits (or until there's
/// nothing left to drop).
fn truncate_if_needed(mut message: Message, bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() <= MAX_UDP_MESSAGE_LEN {
        return bytes;
    }

    message.header.is_truncated = true;
    message.authority.clear();
    message.additional.clear();

    while !message.answers.is_empty() {
        if let Ok(bytes) = serialise_message(&message) {
            if bytes.len() <= MAX_UDP_MESSAGE_LEN {
                return bytes;
            }
        }
        message.answers.pop();
    }

    message.answers.clear();
    serialise_message(&message).unwrap_or_else(|_| {
        // the header alone can't fail to encode; this arm is
        // unreachable in practice.
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_resolver::context::Context;
    use dns_types::protocol::types::test_util::*;
    use dns_types::protocol::types::{Header, Opcode, QueryType, Rcode, RecordType};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket as ClientSocket;

    fn echo_handler(
        ctx: Context,
        question: Question,
        _peer: SocketAddr,
    ) -> impl Future<Output = Message> {
        let _ = ctx;
        async move {
            let mut rr = a_record(&question.name.to_string(), Ipv4Addr::new(5, 5, 5, 5));
            rr.name = question.name.clone();
            Message {
                header: Header {
                    id: question.id,
                    is_response: true,
                    opcode: Opcode::Standard,
                    is_authoritative: true,
                    is_truncated: false,
                    recursion_desired: true,
                    recursion_available: true,
                    rcode: Rcode::NoError,
                },
                questions: vec![question],
                answers: vec![rr],
                authority: vec![],
                additional: vec![],
            }
        }
    }

    #[tokio::test]
    async fn answers_a_single_query_then_stops_on_cancel() {
        let socket = ClientSocket::bind("127.0.0.1:0").await.unwrap();

        // bind an ephemeral port up front so the client knows where
        // to send to before the transport task starts listening.
        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let ctx = Context::background();
        let run_ctx = ctx.clone();
        let transport = UdpTransport::new(addr);
        let handle = tokio::spawn(async move {
            transport
                .run(run_ctx, move |ctx, q, peer| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                    echo_handler(ctx, q, peer)
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let query = Message::from_question(42, question("echo.example.com.", QueryType::Record(RecordType::A)));
        let bytes = serialise_message(&query).unwrap();
        socket.send_to(&bytes, addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = deserialise_message(&buf[..len]).unwrap();

        assert_eq!(response.header.id, 42);
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        ctx.cancel();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn truncation_sets_tc_and_drops_answers_until_it_fits() {
        let mut message = Message::from_question(
            1,
            question("example.com.", QueryType::Record(RecordType::A)),
        );
        message.header.is_response = true;
        for i in 0..200u8 {
            message.answers.push(a_record(
                "www.example.com.",
                Ipv4Addr::new(10, 0, 0, i),
            ));
        }

        let bytes = serialise_message(&message).unwrap();
        assert!(bytes.len() > MAX_UDP_MESSAGE_LEN);

        let truncated = truncate_if_needed(message, bytes);
        assert!(truncated.len() <= MAX_UDP_MESSAGE_LEN);

        let decoded = deserialise_message(&truncated).unwrap();
        assert!(decoded.header.is_truncated);
    }
}
