//! End-to-end tests for the resolver service: policy loading, cache
//! behavior, lie synthesis, and verbatim forwarding against live
//! loopback upstreams.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pinocchio::config::OPT_TTL;
use pinocchio::dns::wire::{self, QTYPE_A, QTYPE_AAAA};
use pinocchio::World;

use tokio::net::UdpSocket;

/// Serve `build_response(request, ips, <asked qtype>)` for each incoming
/// query, recording the qtype of every request seen.
async fn spawn_upstream(ips: Vec<IpAddr>) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<u16>>>) {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = server.local_addr().unwrap().to_string();
    let hits = Arc::new(AtomicUsize::new(0));
    let qtypes = Arc::new(Mutex::new(Vec::new()));

    let hit_counter = hits.clone();
    let qtype_log = qtypes.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        loop {
            let (n, peer) = match server.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => return,
            };
            hit_counter.fetch_add(1, Ordering::SeqCst);
            let (_, qtype, _) = wire::get_qname(&buf[..n]).unwrap();
            qtype_log.lock().unwrap().push(qtype);
            let response = wire::build_response(&buf[..n], &ips, qtype);
            let _ = server.send_to(&response, peer).await;
        }
    });

    (address, hits, qtypes)
}

fn client_request(name: &str, qtype: u16, id: u16) -> Vec<u8> {
    let mut request = wire::pack_request(name, qtype, "");
    request[0..2].copy_from_slice(&id.to_be_bytes());
    request
}

#[tokio::test]
async fn policied_binding_lies_from_the_cache() {
    let world = World::new();
    world
        .load_config_str("method=ttl\nexample.com=1.1.1.1\n")
        .unwrap();

    let config = world.config_lookup("example.com").unwrap();
    assert_eq!(config.option & OPT_TTL, OPT_TTL);

    // host-local lookup sees the index and the real addresses
    let (index, ips) = world.ns_lookup("example.com", QTYPE_A, "").await;
    assert_eq!(index, 1);
    assert_eq!(ips, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);

    // the wire answer is a lie carrying that index
    let request = client_request("example.com", QTYPE_A, 0x0703);
    let response = world.ns_request(&request).await.unwrap();
    assert_eq!(&response[0..2], &[0x07, 0x03]); // ID echoed
    let answers = wire::get_answers(&response);
    assert_eq!(answers, vec!["6.0.0.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(wire::lie_index(&answers[0]), Some(1));
    assert_eq!(world.nose_name(1).as_deref(), Some("example.com"));
}

#[tokio::test]
async fn unpolicied_query_forwards_verbatim() {
    let (address, hits, _) = spawn_upstream(vec!["93.184.216.34".parse().unwrap()]).await;
    let world = World::new();
    world.set_upstream_descriptor(&format!("udp://{address}"));

    let request = client_request("plain.com", QTYPE_A, 0xBEEF);
    let response = world.ns_request(&request).await.unwrap();

    // the upstream's reply comes back untouched
    assert_eq!(&response[0..2], &[0xBE, 0xEF]);
    assert_eq!(&response[2..4], &[0x81, 0x80]);
    assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
    assert_eq!(
        wire::get_answers(&response),
        vec!["93.184.216.34".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // memoized without an index; the repeat answer is served locally
    let repeat = world.ns_request(&request).await.unwrap();
    assert_eq!(
        wire::get_answers(&repeat),
        vec!["93.184.216.34".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(world.nose_len(), 1);
}

#[tokio::test]
async fn policied_resolution_lies_and_memoizes() {
    let (address, hits, qtypes) = spawn_upstream(vec!["203.0.113.20".parse().unwrap()]).await;
    let world = World::new();
    world
        .load_config_str(&format!("server=udp://{address}\nmethod=ttl\n.lied.com\n"))
        .unwrap();

    let request = client_request("www.lied.com", QTYPE_A, 0x0101);
    let response = world.ns_request(&request).await.unwrap();
    let answers = wire::get_answers(&response);
    let index = wire::lie_index(&answers[0]).unwrap();
    assert_eq!(world.nose_name(index).as_deref(), Some("www.lied.com"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(qtypes.lock().unwrap().as_slice(), &[QTYPE_A]);

    // the real addresses are memoized behind the lie
    let memo = world.load_cache("www.lied.com", QTYPE_A).unwrap();
    assert_eq!(memo.index, index);
    assert_eq!(memo.addresses, vec!["203.0.113.20".parse::<IpAddr>().unwrap()]);

    // a repeat query is answered from the cache with the same index
    let repeat = world.ns_request(&request).await.unwrap();
    let answers = wire::get_answers(&repeat);
    assert_eq!(wire::lie_index(&answers[0]), Some(index));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ipv6_flag_forces_aaaa_upstream_and_lies() {
    let (address, hits, qtypes) = spawn_upstream(vec!["2001:db8::66".parse().unwrap()]).await;
    let world = World::new();
    world
        .load_config_str(&format!(
            "server=udp://{address}\nmethod=ttl,ipv6\n.lied6.com\n"
        ))
        .unwrap();

    // an A query resolves over AAAA upstream and still lies in A form
    let request = client_request("www.lied6.com", QTYPE_A, 0x0202);
    let response = world.ns_request(&request).await.unwrap();
    let answers = wire::get_answers(&response);
    let index = wire::lie_index(&answers[0]).unwrap();
    assert!(index > 0);
    assert_eq!(qtypes.lock().unwrap().as_slice(), &[QTYPE_AAAA]);

    let memo = world.load_cache("www.lied6.com", QTYPE_A).unwrap();
    assert_eq!(memo.addresses, vec!["2001:db8::66".parse::<IpAddr>().unwrap()]);

    // the follow-up AAAA query is served locally with no answers
    let request6 = client_request("www.lied6.com", QTYPE_AAAA, 0x0203);
    let response6 = world.ns_request(&request6).await.unwrap();
    assert!(wire::get_answers(&response6).is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pd_prefix_synthesizes_cross_family_addresses() {
    let (address, _, _) = spawn_upstream(vec!["203.0.113.5".parse().unwrap()]).await;
    let world = World::new();

    let (index, ips) = world
        .ns_lookup(
            "nat64.example",
            QTYPE_A,
            &format!("udp://{address}/pd=64:ff9b::"),
        )
        .await;
    assert!(index > 0);
    assert_eq!(ips, vec!["64:ff9b::203.0.113.5".parse::<IpAddr>().unwrap()]);
}

#[tokio::test]
async fn empty_binding_is_poisoned_at_load() {
    let world = World::new();
    world
        .load_config_str("method=ttl\nwall.example=\n")
        .unwrap();

    let request = client_request("wall.example", QTYPE_A, 0x0404);
    let response = world.ns_request(&request).await.unwrap();
    // poisoned at load time: the lie needs no upstream at all
    let answers = wire::get_answers(&response);
    assert!(wire::lie_index(&answers[0]).is_some());
}

#[tokio::test]
async fn concurrent_requests_share_one_nose_entry_per_name() {
    let world = Arc::new(World::new());
    world
        .load_config_str("method=ttl\nbusy.example=10.0.0.1\n")
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u16 {
        let world = world.clone();
        tasks.push(tokio::spawn(async move {
            let request = client_request("busy.example", QTYPE_A, 0x1000 + i);
            let response = world.ns_request(&request).await.unwrap();
            wire::lie_index(&wire::get_answers(&response)[0]).unwrap()
        }));
    }

    let mut indices = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap());
    }
    indices.dedup();
    assert_eq!(indices, vec![1]);
    assert_eq!(world.nose_len(), 2);
}

#[tokio::test]
async fn pac_script_tracks_loaded_policy() {
    let world = World::new();
    world
        .load_config_str("method=ttl\nblocked.example=1.2.3.4\nsubdomain=2\n")
        .unwrap();

    let script = world.pac("192.0.2.1:1080");
    assert!(script.contains("var proxy = 'SOCKS 192.0.2.1:1080';"));
    assert!(script.contains("\"blocked.example\":1,"));
    assert!(script.contains("for (var i = 0; i < 2; i++)"));
}
