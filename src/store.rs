// src/store.rs — durable task queues
//
// Each queue (scheduled, active, history) is one SQLite table with one row
// per task: the full task serialized as JSON plus a handful of projected
// columns for indexed queries. Every store carries its own lock; callers
// never observe a half-written row.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::Result;
use crate::task::{Task, TaskType};

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS task_table (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT,
        sample_id TEXT,
        priority REAL,
        sample_number INTEGER,
        device TEXT,
        task_type TEXT,
        channel INTEGER,
        task TEXT,
        target_device TEXT,
        target_channel INTEGER
    )";

/// Thread-safe, durable task container.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> Result<TaskStore> {
        let conn = Connection::open(path)?;
        conn.execute(CREATE_TABLE_SQL, [])?;
        Ok(TaskStore {
            conn: Mutex::new(conn),
        })
    }

    /// Volatile store, used by unit tests.
    pub fn in_memory() -> Result<TaskStore> {
        let conn = Connection::open_in_memory()?;
        conn.execute(CREATE_TABLE_SQL, [])?;
        Ok(TaskStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("task store lock poisoned")
    }

    pub fn empty(&self) -> Result<bool> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT count(*) FROM (SELECT 1 FROM task_table LIMIT 1)", [], |row| {
                row.get(0)
            })?;
        Ok(count == 0)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM task_table", [])?;
        Ok(())
    }

    /// Stores a task, projecting the columns the scheduler queries on. The
    /// target columns are the endpoints of a multi-step transfer.
    pub fn put(&self, task: &Task) -> Result<()> {
        let serialized = serde_json::to_string_pretty(task)?;
        let first = task.first();
        let last = task.last();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task_table (
                task, priority, task_id, sample_id, sample_number, channel,
                task_type, device, target_channel, target_device
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                serialized,
                task.priority,
                task.id.to_string(),
                task.sample_id.map(|id| id.to_string()),
                task.sample_number.map(|n| n as i64),
                first.and_then(|s| s.channel.map(|c| c as i64)),
                task.task_type.as_str(),
                first.map(|s| s.device.as_str()),
                last.and_then(|s| s.channel.map(|c| c as i64)),
                last.map(|s| s.device.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, task_id: Uuid) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM task_table WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        Ok(())
    }

    /// Replaces the row carrying the task's id with the given task.
    pub fn replace(&self, task: &Task) -> Result<()> {
        self.remove(task.id)?;
        self.put(task)
    }

    pub fn get_all(&self) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT task FROM task_table ORDER BY priority DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    pub fn get_task_by_id(&self, task_id: Uuid) -> Result<Option<Task>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT task FROM task_table WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_task_by_sample_number(&self, sample_number: u64) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT task FROM task_table WHERE sample_number = ?1 ORDER BY priority DESC")?;
        let rows = stmt.query_map(params![sample_number as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    /// Highest-priority task whose type is in `task_types` and whose sample
    /// number is not blocked. `remove` controls whether the row is deleted.
    pub fn get_and_remove_by_priority(
        &self,
        task_types: &[TaskType],
        remove: bool,
        blocked_samples: &[u64],
    ) -> Result<Option<Task>> {
        if task_types.is_empty() {
            return Ok(None);
        }
        // Both filter lists are internal values (enum tags and integers), so
        // assembling the IN clauses textually is safe.
        let types = task_types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let mut sql = format!("SELECT task FROM task_table WHERE task_type IN ({types})");
        if !blocked_samples.is_empty() {
            let blocked = blocked_samples
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" AND sample_number NOT IN ({blocked})"));
        }
        sql.push_str(" ORDER BY priority DESC LIMIT 1");

        let conn = self.lock();
        let raw: Option<String> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        let task: Option<Task> = match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        if remove {
            if let Some(task) = &task {
                conn.execute(
                    "DELETE FROM task_table WHERE task_id = ?1",
                    params![task.id.to_string()],
                )?;
            }
        }
        Ok(task)
    }

    pub fn get_lowest_sample_number(&self) -> Result<Option<u64>> {
        let conn = self.lock();
        let min: Option<i64> =
            conn.query_row("SELECT MIN(sample_number) FROM task_table", [], |row| row.get(0))?;
        Ok(min.map(|n| n as u64))
    }

    /// Union of channels used by stored sub-tasks, optionally restricted to
    /// one sample number and/or one device.
    pub fn find_channels(
        &self,
        sample_number: Option<u64>,
        device_name: Option<&str>,
    ) -> Result<Vec<usize>> {
        let tasks = match sample_number {
            Some(n) => self.get_task_by_sample_number(n)?,
            None => self.get_all()?,
        };
        let mut channels = Vec::new();
        for task in &tasks {
            for sub in &task.tasks {
                if device_name.map_or(true, |d| sub.device == d) {
                    if let Some(channel) = sub.channel {
                        if !channels.contains(&channel) {
                            channels.push(channel);
                        }
                    }
                }
            }
        }
        channels.sort_unstable();
        Ok(channels)
    }

    /// True iff any of the task's sub-tasks collides with a stored task on
    /// the same (device, channel).
    pub fn find_interference(&self, task: &Task) -> Result<bool> {
        for sub in &task.tasks {
            if let Some(channel) = sub.channel {
                let busy = self.find_channels(None, Some(&sub.device))?;
                if busy.contains(&channel) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Projects the downstream (device, channel) path of a sample currently
    /// sitting at `device_name`/`channel` by chaining through the stored
    /// transfer tasks. Only the first-found path is followed.
    pub fn get_future_devices(
        &self,
        sample_number: u64,
        device_name: &str,
        channel: Option<usize>,
    ) -> Result<Vec<(String, Option<usize>)>> {
        let transfers: Vec<Task> = self
            .get_task_by_sample_number(sample_number)?
            .into_iter()
            .filter(|t| t.task_type == TaskType::Transfer)
            .collect();

        let mut path: Vec<(String, Option<usize>)> = Vec::new();
        let mut current_device = device_name.to_string();
        let mut current_channel = channel;

        for task in &transfers {
            let Some(first) = task.first() else { continue };
            if first.device == current_device
                && (current_channel.is_none() || current_channel == first.channel)
            {
                for sub in &task.tasks {
                    current_device = sub.device.clone();
                    current_channel = sub.channel;
                    let hop = (current_device.clone(), current_channel);
                    if !path.contains(&hop) {
                        path.push(hop);
                    }
                }
            }
        }
        Ok(path)
    }
}
