// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tracing::trace;

/// Turns a published `host:port` endpoint into a socket address.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
	async fn resolve(&self, endpoint: &str) -> io::Result<SocketAddr>;
}

/// System resolver. Literal addresses are parsed without a lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl EndpointResolver for DnsResolver {
	async fn resolve(&self, endpoint: &str) -> io::Result<SocketAddr> {
		if let Ok(addr) = endpoint.parse::<SocketAddr>() {
			return Ok(addr);
		}

		trace!(%endpoint, "resolving endpoint");
		tokio::net::lookup_host(endpoint)
			.await?
			.next()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn literal_endpoint_needs_no_lookup() {
		let addr = DnsResolver.resolve("192.0.2.4:51820").await.unwrap();
		assert_eq!(addr, "192.0.2.4:51820".parse().unwrap());
	}

	#[tokio::test]
	async fn bracketed_ipv6_literal() {
		let addr = DnsResolver.resolve("[2001:db8::4]:51820").await.unwrap();
		assert_eq!(addr.port(), 51820);
		assert!(addr.is_ipv6());
	}

	#[tokio::test]
	async fn missing_port_is_an_error() {
		assert!(DnsResolver.resolve("192.0.2.4").await.is_err());
	}
}
