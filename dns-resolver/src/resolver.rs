use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info_span, warn, Instrument};

use dns_types::protocol::types::{
    CacheKey, DomainName, Header, Message, Opcode, Origin, QueryClass, QueryType, Question,
    RecordClass, RecordType, Rcode,
};

use crate::blocklist::Blocklist;
use crate::cache::SharedCache;
use crate::context::Context;
use crate::forwarder::Forwarder;
use crate::metrics::MetricsSink;
use crate::zonecache::{FindResult, ZoneCache};

/// Default CNAME-chain / recursion-depth bound, matching spec.md §6's
/// documented default for `max_recursion`.
pub const DEFAULT_MAX_RECURSION: usize = 8;

/// The capability set the resolver is parameterized over (spec.md
/// §9's "dependency inversion for repositories and gateways"). Tests
/// swap in fakes for any of these; the binary wires up the real
/// things.
pub struct Resolver {
    pub blocklist: Arc<dyn Blocklist>,
    pub zones: Arc<ZoneCache>,
    pub cache: Option<SharedCache>,
    pub forwarder: Forwarder,
    pub metrics: Arc<dyn MetricsSink>,
    pub max_recursion: usize,
}

impl Resolver {
    pub fn new(
        blocklist: Arc<dyn Blocklist>,
        zones: Arc<ZoneCache>,
        cache: Option<SharedCache>,
        forwarder: Forwarder,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            blocklist,
            zones,
            cache,
            forwarder,
            metrics,
            max_recursion: DEFAULT_MAX_RECURSION,
        }
    }

    pub fn with_max_recursion(mut self, max_recursion: usize) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    /// Entry point: spec.md §4.7.  Every accepted query produces
    /// exactly one response, echoing `id` and `question`.
    pub async fn handle_query(
        &self,
        ctx: &Context,
        question: &Question,
        client_addr: SocketAddr,
    ) -> Message {
        let started = std::time::Instant::now();
        let span = info_span!("handle_query", id = question.id, question = %question, %client_addr);

        let response = self.handle_query_inner(ctx, question).instrument(span).await;

        self.metrics.record_query_latency(started.elapsed());
        response
    }

    async fn handle_query_inner(&self, ctx: &Context, question: &Question) -> Message {
        // 1. Validation.
        let is_unsupported_type = matches!(
            question.qtype,
            QueryType::Record(rtype) if rtype.is_not_implemented()
        );
        if !matches!(question.qclass, QueryClass::Record(RecordClass::IN))
            || is_unsupported_type
            || question.is_unknown()
        {
            self.metrics.record_not_implemented();
            return respond(question, Rcode::NotImplemented, Vec::new(), false);
        }

        // 2. Blocklist.
        if self.blocklist.is_blocked(&question.name) {
            self.metrics.record_blocked();
            return respond(question, Rcode::Refused, Vec::new(), false);
        }

        // 3. Authoritative path, with in-zone CNAME chain expansion.
        match self.resolve_authoritative(question) {
            AuthOutcome::Answer { rrs, aa } => {
                self.metrics.record_authoritative_hit();
                return respond(question, Rcode::NoError, rrs, aa);
            }
            AuthOutcome::NameError { partial } => {
                self.metrics.record_nxdomain();
                return respond(question, Rcode::NameError, partial, true);
            }
            AuthOutcome::ServerFailure { partial } => {
                self.metrics.record_servfail();
                return respond(question, Rcode::ServerFailure, partial, true);
            }
            AuthOutcome::NotCovered => {}
        }

        // 4. Response-cache lookup.
        if let Some(cache) = &self.cache {
            let key = question.cache_key();
            if let Some(hit) = cache.get(&key) {
                if !hit.is_empty() {
                    self.metrics.record_cache_hit();
                    return respond(question, Rcode::NoError, hit, false);
                }
            }
            self.metrics.record_cache_miss();
        }

        // 5. Upstream resolution.
        let now = std::time::Instant::now();
        match self.forwarder.resolve(ctx, question, now).await {
            Err(err) => {
                warn!(error = %err, "upstream resolution failed");
                self.metrics.record_upstream_miss();
                respond(question, Rcode::ServerFailure, Vec::new(), false)
            }
            Ok(reply) => {
                self.metrics.record_upstream_hit();

                if reply.header.rcode == Rcode::NoError && !reply.answers.is_empty() {
                    if let Some(cache) = &self.cache {
                        self.insert_into_cache(cache, &reply.answers, now);
                    }
                }

                Message {
                    header: Header {
                        id: question.id,
                        is_response: true,
                        opcode: Opcode::Standard,
                        is_authoritative: false,
                        is_truncated: false,
                        recursion_desired: true,
                        recursion_available: true,
                        rcode: reply.header.rcode,
                    },
                    questions: vec![question.clone()],
                    answers: reply.answers,
                    authority: reply.authority,
                    additional: reply.additional,
                }
            }
        }
    }

    /// Groups upstream answers by `CacheKey()` and inserts each group.
    /// Caching failures are logged and never surface to the caller
    /// (spec.md §4.7/§7: "a cache write failure is never fatal").
    fn insert_into_cache(
        &self,
        cache: &SharedCache,
        answers: &[dns_types::protocol::types::ResourceRecord],
        now: std::time::Instant,
    ) {
        let mut groups: HashMap<CacheKey, Vec<dns_types::protocol::types::ResourceRecord>> =
            HashMap::new();

        for rr in answers {
            let mut rr = rr.clone();
            rr.origin = Origin::Cached;
            rr.expires_at = Some(now + Duration::from_secs(u64::from(rr.ttl)));
            groups.entry(rr.cache_key()).or_default().push(rr);
        }

        for group in groups.into_values() {
            if let Err(err) = cache.set(group) {
                warn!(error = %err, "cache insertion failed");
            }
        }
    }

    /// Step 3 of spec.md §4.7: the authoritative lookup with in-zone
    /// CNAME chain expansion, loop detection, and depth bound.
    fn resolve_authoritative(&self, question: &Question) -> AuthOutcome {
        let mut current = question.name.clone();
        let mut answers = Vec::new();
        let mut seen: HashSet<DomainName> = HashSet::new();
        let mut depth = 0usize;

        loop {
            let step_question = Question {
                id: question.id,
                name: current.clone(),
                qtype: question.qtype,
                qclass: QueryClass::Record(RecordClass::IN),
            };

            match self.zones.find(&step_question) {
                FindResult::NotCovered => {
                    return if answers.is_empty() {
                        AuthOutcome::NotCovered
                    } else {
                        // partial-chain policy: the in-zone CNAMEs
                        // found so far are returned as-is, with no
                        // attempt to resolve the out-of-zone tail.
                        AuthOutcome::Answer { rrs: answers, aa: true }
                    };
                }
                FindResult::NameError => {
                    return AuthOutcome::NameError { partial: answers };
                }
                FindResult::Found(rrs) if rrs.is_empty() => {
                    // NODATA: the name exists but has nothing for
                    // this question and no CNAME to follow.
                    return AuthOutcome::Answer { rrs: answers, aa: true };
                }
                FindResult::Found(rrs) => {
                    let found_requested_type = rrs.iter().any(|rr| rr.matches(&step_question));
                    answers.extend(rrs.clone());

                    if found_requested_type || question.qtype == QueryType::Record(RecordType::CNAME)
                    {
                        return AuthOutcome::Answer { rrs: answers, aa: true };
                    }

                    // otherwise `rrs` is the single substituted CNAME
                    // for this name; follow the chain.
                    let target = rrs.iter().find_map(|rr| match &rr.rtype_with_data {
                        dns_types::protocol::types::RecordTypeWithData::CNAME { cname } => {
                            Some(cname.clone())
                        }
                        _ => None,
                    });

                    let Some(target) = target else {
                        return AuthOutcome::Answer { rrs: answers, aa: true };
                    };

                    if seen.contains(&target) || depth >= self.max_recursion {
                        return AuthOutcome::ServerFailure { partial: answers };
                    }

                    seen.insert(current.clone());
                    current = target;
                    depth += 1;
                }
            }
        }
    }
}

enum AuthOutcome {
    Answer {
        rrs: Vec<dns_types::protocol::types::ResourceRecord>,
        aa: bool,
    },
    NameError {
        partial: Vec<dns_types::protocol::types::ResourceRecord>,
    },
    ServerFailure {
        partial: Vec<dns_types::protocol::types::ResourceRecord>,
    },
    NotCovered,
}

fn respond(
    question: &Question,
    rcode: Rcode,
    answers: Vec<dns_types::protocol::types::ResourceRecord>,
    is_authoritative: bool,
) -> Message {
    Message {
        header: Header {
            id: question.id,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative,
            is_truncated: false,
            recursion_desired: true,
            recursion_available: true,
            rcode,
        },
        questions: vec![question.clone()],
        answers,
        authority: Vec::new(),
        additional: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::{AllowAll, Blocklist};
    use crate::forwarder::{default_dial, Forwarder};
    use crate::metrics::NoopMetrics;
    use dns_types::protocol::deserialise::deserialise_message;
    use dns_types::protocol::serialise::serialise_message;
    use dns_types::protocol::types::test_util::*;
    use dns_types::protocol::types::{QueryType, RecordType, ResourceRecord};
    use dns_types::zones::types::Zone;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    /// Spawns an in-process fake upstream that answers every query with
    /// the given answers, counting how many queries it has served.
    async fn fake_upstream(answers: Vec<ResourceRecord>) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = deserialise_message(&buf[..len]) else {
                    continue;
                };
                counted.fetch_add(1, Ordering::SeqCst);
                let mut response = query.make_response();
                response.answers.clone_from(&answers);
                let bytes = serialise_message(&response).unwrap();
                let _ = socket.send_to(&bytes, peer).await;
            }
        });

        (addr, hits)
    }

    /// A resolver with no authoritative zones, so every query falls
    /// through to the response cache and then the upstream forwarder.
    fn resolver_with_upstream(upstream: SocketAddr, cache_size: usize) -> Resolver {
        Resolver::new(
            Arc::new(AllowAll),
            Arc::new(ZoneCache::new()),
            Some(SharedCache::new(cache_size)),
            Forwarder::new(vec![upstream], Duration::from_millis(200), false).with_dial(default_dial()),
            Arc::new(NoopMetrics),
        )
    }

    struct DenyList(Vec<&'static str>);

    impl Blocklist for DenyList {
        fn is_blocked(&self, name: &DomainName) -> bool {
            self.0.iter().any(|blocked| domain(blocked) == *name)
        }
    }

    fn resolver_with_zone(zone: Zone) -> Resolver {
        let zones = ZoneCache::new();
        zones.put_zone(zone);

        Resolver::new(
            Arc::new(AllowAll),
            Arc::new(zones),
            Some(SharedCache::new(100)),
            Forwarder::new(
                vec!["127.0.0.1:1".parse().unwrap()],
                Duration::from_millis(50),
                false,
            )
            .with_dial(default_dial()),
            Arc::new(NoopMetrics),
        )
    }

    fn client() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn s1_authoritative_a() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(a_record("api.example.com.", Ipv4Addr::new(10, 0, 0, 1)));
        let resolver = resolver_with_zone(zone);

        let q = question("api.example.com.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(response.header.is_authoritative);
        assert_eq!(response.answers.len(), 1);
    }

    #[tokio::test]
    async fn s3_nxdomain() {
        let zone = Zone::new(domain("example.com."));
        let resolver = resolver_with_zone(zone);

        let q = question("missing.example.com.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::NameError);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn s4_cname_chain() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(cname_record("blog.example.com.", "www.example.com."));
        zone.insert(a_record("www.example.com.", Ipv4Addr::new(10, 0, 0, 2)));
        let resolver = resolver_with_zone(zone);

        let q = question("blog.example.com.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 2);
    }

    #[tokio::test]
    async fn s5_cname_loop() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(cname_record("a.example.com.", "b.example.com."));
        zone.insert(cname_record("b.example.com.", "a.example.com."));
        let resolver = resolver_with_zone(zone);

        let q = question("a.example.com.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::ServerFailure);
        assert!(response.answers.len() <= resolver.max_recursion);
    }

    #[tokio::test]
    async fn s6_partial_chain_is_noerror() {
        let mut zone = Zone::new(domain("example.com."));
        zone.insert(cname_record("blog.example.com.", "elsewhere.net."));
        let resolver = resolver_with_zone(zone);

        let q = question("blog.example.com.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
    }

    #[tokio::test]
    async fn s9_blocklist() {
        let zones = ZoneCache::new();
        let resolver = Resolver::new(
            Arc::new(DenyList(vec!["ads.example."])),
            Arc::new(zones),
            Some(SharedCache::new(100)),
            Forwarder::new(
                vec!["127.0.0.1:1".parse().unwrap()],
                Duration::from_millis(50),
                false,
            ),
            Arc::new(NoopMetrics),
        );

        let q = question("ads.example.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::Refused);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn not_implemented_for_wrong_class() {
        let zones = ZoneCache::new();
        let resolver = Resolver::new(
            Arc::new(AllowAll),
            Arc::new(zones),
            None,
            Forwarder::new(
                vec!["127.0.0.1:1".parse().unwrap()],
                Duration::from_millis(50),
                false,
            ),
            Arc::new(NoopMetrics),
        );

        let mut q = question("example.com.", QueryType::Record(RecordType::A));
        q.qclass = QueryClass::Record(RecordClass::Unknown(3));

        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::NotImplemented);
    }

    #[tokio::test]
    async fn s2_multi_a_rrset_from_upstream() {
        let answers = vec![
            a_record("dns.google.", Ipv4Addr::new(8, 8, 8, 8)),
            a_record("dns.google.", Ipv4Addr::new(8, 8, 4, 4)),
        ];
        let (upstream, hits) = fake_upstream(answers).await;
        let resolver = resolver_with_upstream(upstream, 100);

        let q = question("dns.google.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(!response.header.is_authoritative);
        assert_eq!(response.answers.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn s7_cache_hit_then_requery_after_expiry() {
        let mut answer = a_record("dns.google.", Ipv4Addr::new(8, 8, 8, 8));
        answer.ttl = 1;
        let (upstream, hits) = fake_upstream(vec![answer]).await;
        let resolver = resolver_with_upstream(upstream, 100);
        let q = question("dns.google.", QueryType::Record(RecordType::A));

        let first = resolver
            .handle_query(&Context::background(), &q, client())
            .await;
        assert_eq!(first.header.rcode, Rcode::NoError);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let second = resolver
            .handle_query(&Context::background(), &q, client())
            .await;
        assert_eq!(second.header.rcode, Rcode::NoError);
        assert!(!second.header.is_authoritative);
        assert_eq!(second.answers, first.answers);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second query should be served from cache");

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let third = resolver
            .handle_query(&Context::background(), &q, client())
            .await;
        assert_eq!(third.header.rcode, Rcode::NoError);
        assert_eq!(hits.load(Ordering::SeqCst), 2, "third query should miss the expired entry");
    }

    #[tokio::test]
    async fn s8_upstream_all_fail_is_servfail_with_no_cache_insertion() {
        let unroutable: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let resolver = Resolver::new(
            Arc::new(AllowAll),
            Arc::new(ZoneCache::new()),
            Some(SharedCache::new(100)),
            Forwarder::new(vec![unroutable], Duration::from_millis(100), false),
            Arc::new(NoopMetrics),
        );

        let q = question("missing.example.", QueryType::Record(RecordType::A));
        let response = resolver
            .handle_query(&Context::background(), &q, client())
            .await;

        assert_eq!(response.header.rcode, Rcode::ServerFailure);
        assert!(response.answers.is_empty());
        assert_eq!(resolver.cache.as_ref().unwrap().len(), 0);
    }
}
