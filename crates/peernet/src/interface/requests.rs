//! Typed request API: one method per wire call, each validating the
//! response shape per spec's field-shape predicates and raising
//! `RequestCorrupted` on any violation.

use {
    super::Interface,
    crate::{error, resolver::ChainResolutionMode, validate, *},
    bitcoin::{consensus::Decodable, Transaction, Txid},
    std::str::FromStr,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MerkleProof {
    pub block_height: u64,
    pub merkle: Vec<String>,
    pub pos: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub height: i64,
    pub tx_hash: String,
    pub fee: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utxo {
    pub tx_pos: u64,
    pub value: u64,
    pub tx_hash: String,
    pub height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxidOrMerkle {
    Txid(String),
    WithMerkle { tx_hash: String, merkle: Vec<String> },
}

fn hex_to_header(hex_str: &str, height: u32) -> Result<HeaderRecord> {
    validate::is_hex_string(hex_str)?;
    let bytes = hex::decode(hex_str).map_err(|e| PeerError::corrupted(e.to_string()))?;
    let array: HeaderBytes = bytes
        .as_slice()
        .try_into()
        .map_err(|_| PeerError::corrupted(format!("header hex was not {HEADER_SIZE} bytes")))?;
    HeaderRecord::from_bytes(height, &array)
}

impl Interface {
    /// `get_block_header(height, mode)`: uses the resolver's header cache if
    /// present, otherwise fetches a single header.
    pub(crate) async fn get_block_header(&self, height: u32, mode: ChainResolutionMode) -> Result<HeaderRecord> {
        if let Some(cached) = self.header_cache.lock().await.get(height) {
            return Ok(cached);
        }

        let timeout = self.timeout_for_mode(mode);
        let result = self
            .session()
            .await?
            .send_request("blockchain.block.header", serde_json::json!([height]), Some(timeout))
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        let hex_str = result
            .as_str()
            .ok_or_else(|| PeerError::corrupted("blockchain.block.header did not return a string"))?;
        hex_to_header(hex_str, height)
    }

    /// `get_block_headers(start_height, count, timeout?, mode?)`. Requires
    /// `0 < count <= CHUNK_SIZE`. The server may return fewer headers than
    /// requested only if the shortfall lies beyond the interface's known tip.
    pub(crate) async fn get_block_headers(
        &self,
        start_height: u32,
        count: u32,
        timeout: Option<Duration>,
        mode: Option<ChainResolutionMode>,
    ) -> Result<Vec<HeaderRecord>> {
        if count == 0 || count > CHUNK_SIZE {
            return Err(PeerError::corrupted(format!("get_block_headers count {count} out of range")));
        }

        let timeout = timeout.unwrap_or_else(|| self.timeout_for_mode(mode.unwrap_or(ChainResolutionMode::Catchup)));
        let result = self
            .session()
            .await?
            .send_request(
                "blockchain.block.headers",
                serde_json::json!([start_height, count]),
                Some(timeout),
            )
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        let count_field = validate::is_non_negative_integer(validate::dict_contains_field(&result, "count")?)?;
        let max_field = validate::is_non_negative_integer(validate::dict_contains_field(&result, "max")?)?;
        if max_field < u64::from(CHUNK_SIZE) {
            return Err(PeerError::corrupted("get_block_headers 'max' below CHUNK_SIZE"));
        }

        let hex_field = validate::dict_contains_field(&result, "hex")?;
        let hex_str = hex_field
            .as_str()
            .ok_or_else(|| PeerError::corrupted("get_block_headers 'hex' was not a string"))?;
        validate::is_hex_string(hex_str)?;
        let bytes = hex::decode(hex_str).map_err(|e| PeerError::corrupted(e.to_string()))?;

        if bytes.len() % HEADER_SIZE != 0 {
            return Err(PeerError::corrupted("get_block_headers 'hex' was not a whole number of headers"));
        }

        let returned = (bytes.len() / HEADER_SIZE) as u32;
        if u64::from(returned) != count_field {
            return Err(PeerError::corrupted("get_block_headers 'count' did not match header bytes returned"));
        }
        if returned > count {
            return Err(PeerError::corrupted("get_block_headers returned more than 'count' claims"));
        }
        if returned != count {
            // A short reply is only tolerated when the shortfall lies at or
            // beyond this interface's own observed tip.
            let tip = self.tip.load(std::sync::atomic::Ordering::Acquire);
            if start_height + returned <= tip {
                return Err(PeerError::corrupted("get_block_headers returned fewer headers than 'count' before tip"));
            }
        }

        let mut headers = Vec::with_capacity(returned as usize);
        for (i, chunk) in bytes.chunks_exact(HEADER_SIZE).enumerate() {
            let array: HeaderBytes = chunk.try_into().expect("chunks_exact yields HEADER_SIZE slices");
            headers.push(HeaderRecord::from_bytes(start_height + i as u32, &array)?);
        }

        Ok(headers)
    }

    fn timeout_for_mode(&self, mode: ChainResolutionMode) -> Duration {
        match mode {
            ChainResolutionMode::Catchup => NetworkTimeout::GENERIC_NORMAL.duration(),
            _ => NetworkTimeout::URGENT_NORMAL.duration(),
        }
    }

    /// Fetches and connects the chunk containing `height`, provided it lies
    /// at or below the configured checkpoint. A no-op if that chunk index is
    /// already being fetched on this interface.
    pub(crate) async fn request_chunk_below_max_checkpoint(&self, height: u32) -> Result<()> {
        assert!(height <= self.config.max_checkpoint(), "height must be within checkpointed range");

        let index = height / CHUNK_SIZE;
        {
            let mut requested = self.requested_chunks.lock().await;
            if requested.contains(&index) {
                return Ok(());
            }
            requested.insert(index);
        }

        let result = async {
            let headers = self
                .get_block_headers(index * CHUNK_SIZE, CHUNK_SIZE, None, Some(ChainResolutionMode::Catchup))
                .await?;
            let mut bytes = Vec::with_capacity(CHUNK_SIZE as usize * HEADER_SIZE);
            for header in headers {
                bytes.extend_from_slice(&header.to_bytes());
            }
            let connected = self.store.connect_chunk(index, &bytes).await?;
            if !connected {
                return Err(PeerError::corrupted("connect_chunk rejected checkpointed chunk"));
            }
            Ok(())
        }
        .await;

        self.requested_chunks.lock().await.remove(&index);
        result
    }

    pub(crate) async fn get_merkle_for_transaction(&self, tx_hash: &str, tx_height: u32) -> Result<MerkleProof> {
        validate::is_hash256_hex(tx_hash)?;

        let result = self
            .session()
            .await?
            .send_request(
                "blockchain.transaction.get_merkle",
                serde_json::json!([tx_hash, tx_height]),
                None,
            )
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        let block_height = validate::is_non_negative_integer(validate::dict_contains_field(&result, "block_height")?)?;
        let pos = validate::is_non_negative_integer(validate::dict_contains_field(&result, "pos")?)?;
        let merkle_field = validate::dict_contains_field(&result, "merkle")?;
        let merkle_list = validate::list_or_tuple(merkle_field)?;

        let mut merkle = Vec::with_capacity(merkle_list.len());
        for entry in merkle_list {
            let s = entry
                .as_str()
                .ok_or_else(|| PeerError::corrupted("merkle entry was not a string"))?;
            validate::is_hash256_hex(s)?;
            merkle.push(s.to_string());
        }

        Ok(MerkleProof { block_height, merkle, pos })
    }

    pub(crate) async fn get_transaction(&self, tx_hash: &str, timeout: Option<Duration>) -> Result<Transaction> {
        validate::is_hash256_hex(tx_hash)?;

        let result = self
            .session()
            .await?
            .send_request("blockchain.transaction.get", serde_json::json!([tx_hash]), timeout)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        let hex_str = result
            .as_str()
            .ok_or_else(|| PeerError::corrupted("blockchain.transaction.get did not return a string"))?;
        validate::is_hex_string(hex_str)?;
        let bytes = hex::decode(hex_str).map_err(|e| PeerError::corrupted(e.to_string()))?;

        let tx = Transaction::consensus_decode(&mut &bytes[..])
            .map_err(|e| PeerError::corrupted(format!("malformed transaction: {e}")))?;

        let expected = Txid::from_str(tx_hash).map_err(|e| PeerError::corrupted(e.to_string()))?;
        if tx.compute_txid() != expected {
            return Err(PeerError::corrupted("returned transaction's txid did not match request"));
        }

        Ok(tx)
    }

    pub(crate) async fn get_history_for_scripthash(&self, scripthash: &str) -> Result<Vec<HistoryEntry>> {
        validate::is_hash256_hex(scripthash)?;

        let result = self
            .session()
            .await?
            .send_request("blockchain.scripthash.get_history", serde_json::json!([scripthash]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;
        let list = validate::list_or_tuple(&result)?;

        let mut entries = Vec::with_capacity(list.len());
        let mut seen_unconfirmed = false;
        let mut last_height: Option<i64> = None;
        let mut seen_txids = std::collections::HashSet::new();

        for item in list {
            let height = validate::is_integer(validate::dict_contains_field(item, "height")?)?;
            let tx_hash = validate::dict_contains_field(item, "tx_hash")?
                .as_str()
                .ok_or_else(|| PeerError::corrupted("history entry tx_hash was not a string"))?
                .to_string();
            validate::is_hash256_hex(&tx_hash)?;

            if !seen_txids.insert(tx_hash.clone()) {
                return Err(PeerError::corrupted("duplicate txid in scripthash history"));
            }

            let confirmed = match height {
                0 | -1 => false,
                h if h > 0 => true,
                _ => return Err(PeerError::corrupted("scripthash history entry had an invalid negative height")),
            };
            if confirmed {
                if seen_unconfirmed {
                    return Err(PeerError::corrupted("confirmed entry followed an unconfirmed one"));
                }
                if let Some(last) = last_height
                    && height < last
                {
                    return Err(PeerError::corrupted("scripthash history heights not monotone"));
                }
                last_height = Some(height);
            } else {
                seen_unconfirmed = true;
            }

            let fee = match item.get("fee") {
                Some(value) => Some(validate::is_non_negative_integer(value)?),
                None if !confirmed => {
                    return Err(PeerError::corrupted("unconfirmed history entry missing 'fee'"));
                }
                None => None,
            };

            entries.push(HistoryEntry { height, tx_hash, fee });
        }

        Ok(entries)
    }

    pub(crate) async fn listunspent_for_scripthash(&self, scripthash: &str) -> Result<Vec<Utxo>> {
        validate::is_hash256_hex(scripthash)?;

        let result = self
            .session()
            .await?
            .send_request("blockchain.scripthash.listunspent", serde_json::json!([scripthash]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;
        let list = validate::list_or_tuple(&result)?;

        let mut utxos = Vec::with_capacity(list.len());
        for item in list {
            let tx_pos = validate::is_non_negative_integer(validate::dict_contains_field(item, "tx_pos")?)?;
            let value = validate::is_non_negative_integer(validate::dict_contains_field(item, "value")?)?;
            let height = validate::is_non_negative_integer(validate::dict_contains_field(item, "height")?)?;
            let tx_hash = validate::dict_contains_field(item, "tx_hash")?
                .as_str()
                .ok_or_else(|| PeerError::corrupted("utxo tx_hash was not a string"))?
                .to_string();
            validate::is_hash256_hex(&tx_hash)?;

            utxos.push(Utxo { tx_pos, value, tx_hash, height });
        }

        Ok(utxos)
    }

    pub(crate) async fn get_balance_for_scripthash(&self, scripthash: &str) -> Result<Balance> {
        validate::is_hash256_hex(scripthash)?;

        let result = self
            .session()
            .await?
            .send_request("blockchain.scripthash.get_balance", serde_json::json!([scripthash]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        let confirmed = validate::is_non_negative_integer(validate::dict_contains_field(&result, "confirmed")?)? as i64;
        let unconfirmed = validate::is_integer(validate::dict_contains_field(&result, "unconfirmed")?)?;

        Ok(Balance { confirmed, unconfirmed })
    }

    pub(crate) async fn get_txid_from_txpos(&self, height: u32, pos: u32, with_merkle: bool) -> Result<TxidOrMerkle> {
        let result = self
            .session()
            .await?
            .send_request(
                "blockchain.transaction.id_from_pos",
                serde_json::json!([height, pos, with_merkle]),
                None,
            )
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        if with_merkle {
            let tx_hash = validate::dict_contains_field(&result, "tx_hash")?
                .as_str()
                .ok_or_else(|| PeerError::corrupted("id_from_pos tx_hash was not a string"))?
                .to_string();
            validate::is_hash256_hex(&tx_hash)?;
            let merkle_list = validate::list_or_tuple(validate::dict_contains_field(&result, "merkle")?)?;
            let mut merkle = Vec::with_capacity(merkle_list.len());
            for entry in merkle_list {
                let s = entry
                    .as_str()
                    .ok_or_else(|| PeerError::corrupted("merkle entry was not a string"))?;
                validate::is_hash256_hex(s)?;
                merkle.push(s.to_string());
            }
            Ok(TxidOrMerkle::WithMerkle { tx_hash, merkle })
        } else {
            let txid = result
                .as_str()
                .ok_or_else(|| PeerError::corrupted("id_from_pos did not return a string"))?
                .to_string();
            validate::is_hash256_hex(&txid)?;
            Ok(TxidOrMerkle::Txid(txid))
        }
    }

    pub(crate) async fn get_fee_histogram(&self) -> Result<Vec<(u64, u64)>> {
        let result = self
            .session()
            .await?
            .send_request("mempool.get_fee_histogram", serde_json::json!([]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;
        let list = validate::list_or_tuple(&result)?;

        let mut histogram = Vec::with_capacity(list.len());
        let mut last_fee: Option<f64> = None;
        for item in list {
            let pair = validate::list_or_tuple(item)?;
            if pair.len() != 2 {
                return Err(PeerError::corrupted("fee histogram entry was not a pair"));
            }
            let fee = validate::is_non_negative_int_or_float(&pair[0])?;
            let size = validate::is_non_negative_integer(&pair[1])?;

            if let Some(last) = last_fee
                && fee >= last
            {
                return Err(PeerError::corrupted("fee histogram fees not strictly decreasing"));
            }
            last_fee = Some(fee);

            histogram.push((fee as u64, size));
        }

        Ok(histogram)
    }

    pub(crate) async fn get_server_banner(&self) -> Result<String> {
        let result = self
            .session()
            .await?
            .send_request("server.banner", serde_json::json!([]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PeerError::corrupted("server.banner did not return a string"))
    }

    /// Returns a valid donation address, or empty if the server returned one
    /// that does not parse — that case is logged, not propagated as an error.
    pub(crate) async fn get_donation_address(&self) -> Result<String> {
        let result = self
            .session()
            .await?
            .send_request("server.donation_address", serde_json::json!([]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;

        let raw = result
            .as_str()
            .ok_or_else(|| PeerError::corrupted("server.donation_address did not return a string"))?;
        if raw.is_empty() {
            return Ok(String::new());
        }

        match bitcoin::Address::from_str(raw) {
            Ok(address) => Ok(address.assume_checked().to_string()),
            Err(err) => {
                tracing::warn!(server = %self.server, %err, "server returned an invalid donation address");
                Ok(String::new())
            }
        }
    }

    /// BTC/kB on the wire, converted to sat/kB.
    pub(crate) async fn get_relay_fee(&self) -> Result<f64> {
        let result = self
            .session()
            .await?
            .send_request("blockchain.relayfee", serde_json::json!([]), None)
            .await;
        let result = self.downgrade_disconnect_triggering(result)?;
        let btc_per_kb = validate::is_non_negative_int_or_float(&result)?;
        Ok(btc_per_kb * 100_000_000.0)
    }

    /// BTC/kB converted to sat/kB, or `-1.0` if the server could not
    /// estimate. Two nonconforming server behaviors are tolerated and
    /// mapped to `-1.0` rather than propagated: a protocol error whose
    /// message mentions "cannot estimate fee", and `INTERNAL_ERROR`.
    pub(crate) async fn get_estimatefee(&self, num_blocks: u32) -> Result<f64> {
        let result = self
            .session()
            .await?
            .send_request("blockchain.estimatefee", serde_json::json!([num_blocks]), None)
            .await;

        let result = match result {
            Err(PeerError::Rpc { code, message })
                if code == error::rpc_code::INTERNAL_ERROR || message.to_lowercase().contains("cannot estimate fee") =>
            {
                return Ok(-1.0);
            }
            other => self.downgrade_disconnect_triggering(other)?,
        };

        let btc_per_kb = validate::is_int_or_float(&result)?;
        if btc_per_kb < 0.0 {
            return Ok(-1.0);
        }
        Ok(btc_per_kb * 100_000_000.0)
    }
}
