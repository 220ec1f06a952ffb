// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::RegistryError;
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// One flat key/value pair read from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
	pub key: String,
	pub value: String,
}

impl RegistryEntry {
	pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
		}
	}
}

/// Read side of the distributed peer registry.
#[async_trait]
pub trait Registry: Send + Sync {
	/// Every entry whose key starts with `prefix`, in whatever order the
	/// store returns them.
	async fn list_under(&self, prefix: &str) -> Result<Vec<RegistryEntry>, RegistryError>;
}

pub struct EtcdRegistry {
	client: Client,
}

impl EtcdRegistry {
	#[instrument(skip(endpoints), fields(endpoints = ?endpoints))]
	pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, RegistryError> {
		let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
		let client = Client::connect(endpoints, Some(options)).await?;
		debug!("connected to etcd");
		Ok(Self { client })
	}
}

#[async_trait]
impl Registry for EtcdRegistry {
	#[instrument(skip(self))]
	async fn list_under(&self, prefix: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
		let mut kv = self.client.kv_client();
		let resp = kv
			.get(prefix, Some(GetOptions::new().with_prefix()))
			.await?;

		let mut entries = Vec::with_capacity(resp.kvs().len());
		for pair in resp.kvs() {
			match (pair.key_str(), pair.value_str()) {
				(Ok(key), Ok(value)) => entries.push(RegistryEntry::new(key, value)),
				_ => trace!(key = ?pair.key(), "skipping non-UTF-8 registry entry"),
			}
		}

		debug!(count = entries.len(), "listed registry entries");
		Ok(entries)
	}
}

impl std::fmt::Debug for EtcdRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EtcdRegistry").finish_non_exhaustive()
	}
}
