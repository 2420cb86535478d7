use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relaytally::control::parse::{Reply, ReplyReader};
use relaytally::control::{extract_peer_addrs, parse_country_summary};
use relaytally::traffic::{by_clients, by_peers, Delta};

const COUNTRIES: [&str; 12] = [
    "ir", "cn", "ru", "us", "de", "fr", "tr", "by", "eg", "vn", "pk", "ua",
];

fn country_summary() -> String {
    COUNTRIES
        .iter()
        .enumerate()
        .map(|(i, cc)| format!("{cc}={}", (i + 1) * 8))
        .collect::<Vec<_>>()
        .join(",")
}

fn orconn_lines(peers: u32) -> Vec<String> {
    let mut lines = vec!["250+orconn-status=".to_string()];
    for i in 0..peers {
        let [a, b, c, d] = (0x0a00_0000u32 + i).to_be_bytes();
        lines.push(format!(
            "${i:040X}~relay{i} CONNECTED {a}.{b}.{c}.{d}:9001"
        ));
    }
    lines.push(".".to_string());
    lines.push("250 OK".to_string());
    lines
}

fn assemble(lines: &[String]) -> Option<Reply> {
    let mut reader = ReplyReader::new();
    for line in lines {
        if let Ok(Some(reply)) = reader.feed(line) {
            return Some(reply);
        }
    }
    None
}

fn bench_parse_replies(c: &mut Criterion) {
    let lines = orconn_lines(512);
    let summary = country_summary();

    c.bench_function("reply/assemble_orconn_512", |b| {
        b.iter(|| black_box(assemble(black_box(&lines))))
    });

    let reply = assemble(&lines).expect("complete reply");
    c.bench_function("reply/extract_peer_addrs_512", |b| {
        b.iter(|| {
            let peers = extract_peer_addrs(reply.text_lines("orconn-status").into_iter());
            black_box(peers.len())
        })
    });

    c.bench_function("reply/parse_country_summary", |b| {
        b.iter(|| black_box(parse_country_summary(black_box(&summary))))
    });
}

fn bench_attribute(c: &mut Criterion) {
    let delta = Delta {
        read: 9_876_543_210,
        written: 1_234_567_890,
    };
    let counts = parse_country_summary(&country_summary());
    let peers: BTreeMap<Ipv4Addr, String> = (0..512u32)
        .map(|i| {
            let cc = COUNTRIES[i as usize % COUNTRIES.len()].to_uppercase();
            (Ipv4Addr::from(0x0a00_0000u32 + i), cc)
        })
        .collect();

    c.bench_function("attribute/by_clients", |b| {
        b.iter(|| black_box(by_clients(black_box(delta), black_box(&counts))))
    });

    c.bench_function("attribute/by_peers_512", |b| {
        b.iter(|| black_box(by_peers(black_box(delta), black_box(&peers))))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_replies(c);
    bench_attribute(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
