//! Originating client address extraction.
//!
//! When the socket peer is a trusted proxy, the X-Forwarded-For chain is
//! walked right to left; the first hop that is not itself a trusted proxy
//! is the client. Anything unparsable falls back to the socket peer.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

pub(crate) fn real_ip(peer: SocketAddr, forwarded_for: Option<&str>, proxies: &[IpNet]) -> IpAddr {
    let remote = peer.ip();
    if !contains(proxies, remote) {
        return remote;
    }

    let Some(xff) = forwarded_for else {
        return remote;
    };
    if xff.trim().is_empty() {
        return remote;
    }

    let mut prev = remote;
    for entry in xff.split(',').rev() {
        let Ok(ip) = entry.trim().parse::<IpAddr>() else {
            return remote;
        };
        if !contains(proxies, ip) {
            return ip;
        }
        prev = ip;
    }
    // every hop is a trusted proxy: the leftmost entry is the best guess
    prev
}

fn contains(proxies: &[IpNet], ip: IpAddr) -> bool {
    proxies.iter().any(|net| net.contains(&ip))
}
