use std::net::SocketAddr;
use std::process;
use std::time::{Duration, Instant};

use clap::Parser;

use dns_resolver::context::Context;
use dns_resolver::forwarder::Forwarder;
use dns_types::protocol::types::{
    DomainName, QueryClass, QueryType, Question, RecordClass, RecordType, ResourceRecord,
};

fn print_section(heading: &str, rrs: &[ResourceRecord]) {
    if rrs.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rr in rrs {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            rr.name,
            rr.ttl,
            rr.rclass,
            rr.rtype_with_data.rtype(),
            rr.rtype_with_data
        );
    }
}

/// Send a single DNS query to a nameserver over UDP and print the
/// decoded response.
#[derive(Parser)]
struct Args {
    /// Domain name to query
    #[clap(value_parser)]
    domain: DomainName,

    /// Query type
    #[clap(default_value_t = QueryType::Record(RecordType::A), value_parser)]
    qtype: QueryType,

    /// Nameserver to query, `ip:port`
    #[clap(short, long, default_value = "127.0.0.1:53", value_parser)]
    server: SocketAddr,

    /// Per-query timeout, in milliseconds
    #[clap(short, long, default_value_t = 2000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let question = Question {
        id: rand::random(),
        name: args.domain,
        qtype: args.qtype,
        qclass: QueryClass::Record(RecordClass::IN),
    };

    println!(";; QUESTION");
    println!("{}\t{}\t{}", question.name, question.qclass, question.qtype);

    let forwarder = Forwarder::new(vec![args.server], Duration::from_millis(args.timeout_ms), false);

    match forwarder
        .resolve(&Context::background(), &question, Instant::now())
        .await
    {
        Ok(response) => {
            println!("\n;; rcode: {}", response.header.rcode);
            print_section("ANSWER", &response.answers);
            print_section("AUTHORITY", &response.authority);
            print_section("ADDITIONAL", &response.additional);
        }
        Err(err) => {
            eprintln!("\n;; query failed: {err}");
            process::exit(1);
        }
    }
}
