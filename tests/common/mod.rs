//! Shared fixtures: a throwaway SQLite housing database and a question-keyed
//! language model.

#![allow(dead_code)]

use async_trait::async_trait;
use housing_query::llm::{LanguageModel, LlmError};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Mutex;

pub const HOUSING_DDL: &str = "
    CREATE TABLE estates (
        estate_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        district TEXT,
        avg_price REAL
    );
    CREATE TABLE buildings (
        building_id INTEGER PRIMARY KEY,
        estate_id INTEGER REFERENCES estates(estate_id),
        building_name TEXT
    );
    CREATE TABLE units (
        unit_id INTEGER PRIMARY KEY,
        building_id INTEGER REFERENCES buildings(building_id),
        floor INTEGER,
        area REAL
    );
    CREATE TABLE transactions (
        tx_id INTEGER PRIMARY KEY,
        unit_id INTEGER REFERENCES units(unit_id),
        price REAL,
        tx_date TEXT
    );
    CREATE TABLE facilities (
        facility_id INTEGER PRIMARY KEY,
        facility_name TEXT
    );
";

pub const HOUSING_DATA: &str = "
    INSERT INTO estates VALUES (1, 'Taikoo Shing', 'Eastern', 15800.0);
    INSERT INTO estates VALUES (2, 'Lohas Park', 'Sai Kung', 13250.0);
    INSERT INTO estates VALUES (3, 'Mei Foo Sun Chuen', 'Sham Shui Po', 12100.0);
    INSERT INTO estates VALUES (4, 'Kornhill', 'Eastern', 14900.0);
    INSERT INTO buildings VALUES (10, 1, 'Kam Din Mansion');
    INSERT INTO buildings VALUES (11, 1, 'Kam Fung Mansion');
    INSERT INTO buildings VALUES (20, 2, 'The Capitol');
    INSERT INTO units VALUES (100, 10, 12, 650.0);
    INSERT INTO units VALUES (101, 10, 25, 720.0);
    INSERT INTO units VALUES (200, 20, 30, 480.0);
    INSERT INTO transactions VALUES (1000, 100, 8250000.0, '2024-03-02');
    INSERT INTO transactions VALUES (1001, 101, 9900000.0, '2024-05-18');
    INSERT INTO transactions VALUES (2000, 200, 6400000.0, '2024-04-11');
    INSERT INTO facilities VALUES (1, 'Swimming pool');
";

/// Create a fresh housing database file and return its path.
pub fn housing_db() -> PathBuf {
    let path = std::env::temp_dir().join(format!("housing-it-{}.db", uuid::Uuid::new_v4()));
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(HOUSING_DDL).unwrap();
    conn.execute_batch(HOUSING_DATA).unwrap();
    path
}

/// Answers each prompt with the response registered for the first key the
/// prompt contains. Safe to share between concurrent pipeline runs.
pub struct KeyedModel {
    routes: Vec<(String, String)>,
    prompts: Mutex<Vec<String>>,
}

impl KeyedModel {
    pub fn new(routes: &[(&str, &str)]) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for KeyedModel {
    async fn complete(&self, prompt: &str, _schema_context: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        // Yield so concurrent runs interleave.
        tokio::task::yield_now().await;
        self.routes
            .iter()
            .find(|(key, _)| prompt.contains(key.as_str()))
            .map(|(_, response)| response.clone())
            .ok_or(LlmError::EmptyResponse)
    }
}
