//! SQLite database storage
//!
//! Results stay here from collection until the server acknowledges the
//! upload. The current server schedule and run counters survive restarts.

use anyhow::{Context, Result};
use protocol::wire::{WireResult, WireTaskDescriptor};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const DATABASE_FILE_NAME: &str = "agent.db";

pub const STAT_COMPLETED: &str = "completed";
pub const STAT_FAILED: &str = "failed";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    
    #[error("Stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// A stored result with its row id
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: i64,
    pub result: WireResult,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .context("Failed to open database")?;
        
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        
        conn.pragma_update(None, "busy_timeout", "5000")
            .context("Failed to set busy timeout")?;
        
        Ok(Self { conn })
    }
    
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.initialize()?;
        Ok(db)
    }
    
    pub fn initialize(&self) -> Result<()> {
        info!("Initializing database schema");
        
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_key TEXT,
                kind TEXT NOT NULL,
                success INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                json TEXT NOT NULL
            )",
            [],
        )?;
        
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_results_timestamp ON results(timestamp)",
            [],
        )?;
        
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schedule (
                key TEXT PRIMARY KEY,
                json TEXT NOT NULL
            )",
            [],
        )?;
        
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS stats (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        
        Ok(())
    }
    
    pub fn store_result(&self, result: &WireResult) -> Result<i64, StorageError> {
        let json = serde_json::to_string(result)?;
        self.conn.execute(
            "INSERT INTO results (task_key, kind, success, timestamp, json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![result.task_key, result.kind, result.success, result.timestamp, json],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Stored result {} ({}, key {:?})", id, result.kind, result.task_key);
        Ok(id)
    }
    
    /// Results not yet acknowledged by the server, oldest first
    pub fn pending_results(&self) -> Result<Vec<StoredResult>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT id, json FROM results ORDER BY timestamp, id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        
        let mut results = Vec::new();
        for row in rows {
            let (id, json) = row?;
            results.push(StoredResult {
                id,
                result: serde_json::from_str(&json)?,
            });
        }
        Ok(results)
    }
    
    pub fn pending_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(count as usize)
    }
    
    pub fn delete_results(&mut self, ids: &[i64]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM results WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        debug!("Deleted {} uploaded results", ids.len());
        Ok(())
    }
    
    /// Replace the persisted schedule
    pub fn save_schedule(&mut self, schedule: &[WireTaskDescriptor]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM schedule", [])?;
        {
            let mut stmt = tx.prepare("INSERT OR REPLACE INTO schedule (key, json) VALUES (?1, ?2)")?;
            for task in schedule {
                let Some(key) = &task.key else {
                    continue;
                };
                stmt.execute(params![key, serde_json::to_string(task)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
    
    pub fn load_schedule(&self) -> Result<Vec<WireTaskDescriptor>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT json FROM schedule ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        
        let mut schedule = Vec::new();
        for row in rows {
            schedule.push(serde_json::from_str(&row?)?);
        }
        Ok(schedule)
    }
    
    pub fn increment_stat(&self, name: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO stats (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )?;
        Ok(())
    }
    
    pub fn stat(&self, name: &str) -> Result<u64, StorageError> {
        let value: Option<i64> = self
            .conn
            .query_row("SELECT value FROM stats WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }
}
