//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Materialized wallets (key: user_id)
//! - `orders` - Orders (key: order_id)
//! - `transactions` - Append-only ledger (key: big-endian sequence)
//! - `indices` - Secondary indices for fast lookups
//! - `meta` - Counters (next sequence)
//!
//! # Unit of Work
//!
//! Every mutation goes through a [`UnitOfWork`]. [`Storage::begin`] takes the
//! storage write lock and returns a [`StorageTxn`] that stages wallet, order
//! and ledger writes in memory (reads see staged writes first). `commit`
//! writes everything in one `WriteBatch`; dropping the unit discards it.

use crate::{
    error::{Error, Result},
    types::{Order, OrderStatus, Transaction, UserId, Wallet},
    Config,
};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_ORDERS: &str = "orders";
const CF_TRANSACTIONS: &str = "transactions";
const CF_INDICES: &str = "indices";
const CF_META: &str = "meta";

/// Index key tags
const IDX_WALLET_TX: u8 = b'W';
const IDX_ORDER_TX: u8 = b'O';
const IDX_TX_ID: u8 = b'T';
const IDX_ORDER_STATUS: u8 = b'S';
const IDX_BUYER_ORDER: u8 = b'B';

const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Transactional access to wallets, orders and the ledger
///
/// Reads observe the unit's own staged writes. Nothing is visible to other
/// readers until `commit` succeeds; dropping the unit aborts it.
pub trait UnitOfWork {
    /// Read a wallet
    fn wallet(&mut self, user_id: &UserId) -> Result<Option<Wallet>>;

    /// Stage a wallet write
    fn put_wallet(&mut self, wallet: Wallet);

    /// Read an order
    fn order(&mut self, order_id: Uuid) -> Result<Option<Order>>;

    /// Stage an order write
    fn put_order(&mut self, order: Order) -> Result<()>;

    /// Reserve the next ledger sequence number
    fn allocate_sequence(&mut self) -> Result<u64>;

    /// Stage a ledger entry
    fn append_transaction(&mut self, entry: Transaction);

    /// Atomically apply every staged write; returns the appended entries
    fn commit(self) -> Result<Vec<Transaction>>;
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_WALLETS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_ORDERS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_ledger()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options_ledger() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        // State is frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Begin a unit of work, blocking until the write lock is free
    pub fn begin(&self) -> Result<StorageTxn<'_>> {
        let guard = self.write_lock.lock();
        let next_sequence = self.next_sequence()?;
        Ok(StorageTxn {
            storage: self,
            _guard: guard,
            wallets: HashMap::new(),
            orders: HashMap::new(),
            loaded_status: HashMap::new(),
            entries: Vec::new(),
            next_sequence,
            first_sequence: next_sequence,
        })
    }

    /// Hold off writers until the guard drops
    ///
    /// Passes that read several column families (reconciliation, the
    /// conservation check) hold this so no unit of work commits between
    /// their reads. Must not be held while calling [`Storage::begin`].
    pub fn pause_writers(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    // Wallet reads

    /// Get wallet by owner
    pub fn get_wallet(&self, user_id: &UserId) -> Result<Option<Wallet>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        match self.db.get_cf(cf, user_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All wallets, ordered by owner
    pub fn list_wallets(&self) -> Result<Vec<Wallet>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        let mut wallets = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            wallets.push(bincode::deserialize(&value)?);
        }
        Ok(wallets)
    }

    // Order reads

    /// Get order by ID
    pub fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let cf = self.cf_handle(CF_ORDERS)?;
        match self.db.get_cf(cf, order_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Orders currently in a status
    pub fn orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let prefix = vec![IDX_ORDER_STATUS, status as u8];
        self.scan_index(&prefix)?
            .into_iter()
            .map(|key| {
                let order_id = Self::uuid_suffix(&key)?;
                self.get_order(order_id)?
                    .ok_or_else(|| Error::IntegrityViolation(format!(
                        "Status index points at missing order {}",
                        order_id
                    )))
            })
            .collect()
    }

    /// Orders placed by a buyer
    pub fn orders_by_buyer(&self, buyer_id: &UserId) -> Result<Vec<Order>> {
        let prefix = Self::index_key_buyer(buyer_id, None);
        self.scan_index(&prefix)?
            .into_iter()
            .map(|key| {
                let order_id = Self::uuid_suffix(&key)?;
                self.get_order(order_id)?
                    .ok_or_else(|| Error::IntegrityViolation(format!(
                        "Buyer index points at missing order {}",
                        order_id
                    )))
            })
            .collect()
    }

    // Ledger reads

    /// Get ledger entry by its opaque ID
    pub fn get_transaction(&self, tx_id: Uuid) -> Result<Option<Transaction>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let mut key = vec![IDX_TX_ID];
        key.extend_from_slice(tx_id.as_bytes());
        match self.db.get_cf(cf_indices, &key)? {
            Some(seq) => {
                let sequence = u64::from_be_bytes(Self::fixed_bytes(&seq)?);
                self.get_transaction_at(sequence)
            }
            None => Ok(None),
        }
    }

    fn get_transaction_at(&self, sequence: u64) -> Result<Option<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(cf, sequence.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Entries of a wallet in insertion order
    pub fn wallet_transactions(&self, wallet_id: Uuid) -> Result<Vec<Transaction>> {
        let mut prefix = vec![IDX_WALLET_TX];
        prefix.extend_from_slice(wallet_id.as_bytes());
        self.transactions_for_prefix(&prefix)
    }

    /// Entries referencing an order in insertion order
    pub fn order_transactions(&self, order_id: Uuid) -> Result<Vec<Transaction>> {
        let mut prefix = vec![IDX_ORDER_TX];
        prefix.extend_from_slice(order_id.as_bytes());
        self.transactions_for_prefix(&prefix)
    }

    /// Whole ledger in insertion order
    pub fn all_transactions(&self) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    fn transactions_for_prefix(&self, prefix: &[u8]) -> Result<Vec<Transaction>> {
        self.scan_index(prefix)?
            .into_iter()
            .map(|key| {
                let sequence = u64::from_be_bytes(Self::fixed_bytes(&key[key.len() - 8..])?);
                self.get_transaction_at(sequence)?.ok_or_else(|| {
                    Error::IntegrityViolation(format!(
                        "Index points at missing ledger entry {}",
                        sequence
                    ))
                })
            })
            .collect()
    }

    fn scan_index(&self, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn next_sequence(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_NEXT_SEQUENCE)? {
            Some(value) => Ok(u64::from_be_bytes(Self::fixed_bytes(&value)?)),
            None => Ok(1),
        }
    }

    // Index key helpers

    /// Tag, buyer length (u32 BE), buyer bytes, then the order ID
    ///
    /// The length prefix keeps one buyer's scan from matching IDs that merely
    /// start with it.
    fn index_key_buyer(buyer_id: &UserId, order_id: Option<Uuid>) -> Vec<u8> {
        let buyer = buyer_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(1 + 4 + buyer.len() + 16);
        key.push(IDX_BUYER_ORDER);
        key.extend_from_slice(&(buyer.len() as u32).to_be_bytes());
        key.extend_from_slice(buyer);
        if let Some(order_id) = order_id {
            key.extend_from_slice(order_id.as_bytes());
        }
        key
    }

    fn index_key_status(status: OrderStatus, order_id: Uuid) -> Vec<u8> {
        let mut key = vec![IDX_ORDER_STATUS, status as u8];
        key.extend_from_slice(order_id.as_bytes());
        key
    }

    fn index_key_entry(tag: u8, id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = vec![tag];
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn uuid_suffix(key: &[u8]) -> Result<Uuid> {
        if key.len() < 16 {
            return Err(Error::Storage(format!("Index key too short: {} bytes", key.len())));
        }
        Ok(Uuid::from_bytes(Self::fixed_bytes(&key[key.len() - 16..])?))
    }

    fn fixed_bytes<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
        bytes
            .try_into()
            .map_err(|_| Error::Storage(format!("Expected {} bytes, found {}", N, bytes.len())))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let count = |name: &str| -> Result<u64> {
            let cf = self.cf_handle(name)?;
            let mut n = 0u64;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                item?;
                n += 1;
            }
            Ok(n)
        };

        Ok(StorageStats {
            total_wallets: count(CF_WALLETS)?,
            total_orders: count(CF_ORDERS)?,
            total_transactions: self.next_sequence()? - 1,
        })
    }

    /// Write a wallet row bypassing the ledger
    ///
    /// Only for integrity tests that need to simulate upstream corruption.
    #[cfg(test)]
    pub(crate) fn overwrite_wallet_for_test(&self, wallet: &Wallet) -> Result<()> {
        let cf = self.cf_handle(CF_WALLETS)?;
        self.db
            .put_cf(cf, wallet.user_id.as_str().as_bytes(), bincode::serialize(wallet)?)?;
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Wallet rows
    pub total_wallets: u64,
    /// Order rows
    pub total_orders: u64,
    /// Ledger entries
    pub total_transactions: u64,
}

/// RocksDB-backed unit of work holding the storage write lock
pub struct StorageTxn<'a> {
    storage: &'a Storage,
    _guard: MutexGuard<'a, ()>,
    wallets: HashMap<UserId, Wallet>,
    orders: HashMap<Uuid, Order>,
    /// Status each touched order had when first read, for index maintenance
    loaded_status: HashMap<Uuid, Option<OrderStatus>>,
    entries: Vec<Transaction>,
    next_sequence: u64,
    first_sequence: u64,
}

impl std::fmt::Debug for StorageTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTxn")
            .field("wallets", &self.wallets.len())
            .field("orders", &self.orders.len())
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl UnitOfWork for StorageTxn<'_> {
    fn wallet(&mut self, user_id: &UserId) -> Result<Option<Wallet>> {
        if let Some(wallet) = self.wallets.get(user_id) {
            return Ok(Some(wallet.clone()));
        }
        self.storage.get_wallet(user_id)
    }

    fn put_wallet(&mut self, wallet: Wallet) {
        self.wallets.insert(wallet.user_id.clone(), wallet);
    }

    fn order(&mut self, order_id: Uuid) -> Result<Option<Order>> {
        if let Some(order) = self.orders.get(&order_id) {
            return Ok(Some(order.clone()));
        }
        let order = self.storage.get_order(order_id)?;
        self.loaded_status
            .entry(order_id)
            .or_insert_with(|| order.as_ref().map(|o| o.status));
        Ok(order)
    }

    fn put_order(&mut self, order: Order) -> Result<()> {
        if !self.loaded_status.contains_key(&order.order_id) {
            let existing = self.storage.get_order(order.order_id)?;
            self.loaded_status
                .insert(order.order_id, existing.map(|o| o.status));
        }
        self.orders.insert(order.order_id, order);
        Ok(())
    }

    fn allocate_sequence(&mut self) -> Result<u64> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence
            .checked_add(1)
            .ok_or_else(|| Error::Storage("Ledger sequence exhausted".to_string()))?;
        Ok(sequence)
    }

    fn append_transaction(&mut self, entry: Transaction) {
        self.entries.push(entry);
    }

    fn commit(self) -> Result<Vec<Transaction>> {
        let storage = self.storage;
        let mut batch = WriteBatch::default();

        let cf_wallets = storage.cf_handle(CF_WALLETS)?;
        let cf_orders = storage.cf_handle(CF_ORDERS)?;
        let cf_transactions = storage.cf_handle(CF_TRANSACTIONS)?;
        let cf_indices = storage.cf_handle(CF_INDICES)?;
        let cf_meta = storage.cf_handle(CF_META)?;

        // 1. Wallets
        for wallet in self.wallets.values() {
            batch.put_cf(
                cf_wallets,
                wallet.user_id.as_str().as_bytes(),
                bincode::serialize(wallet)?,
            );
        }

        // 2. Orders and their indices
        for order in self.orders.values() {
            batch.put_cf(cf_orders, order.order_id.as_bytes(), bincode::serialize(order)?);

            let previous = self.loaded_status.get(&order.order_id).copied().flatten();
            if let Some(previous) = previous {
                if previous != order.status {
                    batch.delete_cf(cf_indices, Storage::index_key_status(previous, order.order_id));
                }
            } else {
                batch.put_cf(
                    cf_indices,
                    Storage::index_key_buyer(&order.buyer_id, Some(order.order_id)),
                    b"",
                );
            }
            batch.put_cf(
                cf_indices,
                Storage::index_key_status(order.status, order.order_id),
                b"",
            );
        }

        // 3. Ledger entries and indices
        for entry in &self.entries {
            batch.put_cf(
                cf_transactions,
                entry.sequence.to_be_bytes(),
                bincode::serialize(entry)?,
            );
            batch.put_cf(
                cf_indices,
                Storage::index_key_entry(IDX_WALLET_TX, entry.wallet_id, entry.sequence),
                b"",
            );
            if let Some(order_id) = entry.order_id {
                batch.put_cf(
                    cf_indices,
                    Storage::index_key_entry(IDX_ORDER_TX, order_id, entry.sequence),
                    b"",
                );
            }
            let mut tx_key = vec![IDX_TX_ID];
            tx_key.extend_from_slice(entry.tx_id.as_bytes());
            batch.put_cf(cf_indices, tx_key, entry.sequence.to_be_bytes());
        }

        // 4. Sequence counter
        if self.next_sequence != self.first_sequence {
            batch.put_cf(cf_meta, META_NEXT_SEQUENCE, self.next_sequence.to_be_bytes());
        }

        // Atomic commit
        storage.db.write(batch)?;

        tracing::debug!(
            wallets = self.wallets.len(),
            orders = self.orders.len(),
            entries = self.entries.len(),
            "Unit of work committed"
        );

        Ok(self.entries)
    }
}
