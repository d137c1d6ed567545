use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub frequency: String,
    pub time_of_day: String,
    pub retention_days: i64,
    pub next_run_at: Option<String>,
}

fn row_to_config(row: &Row) -> rusqlite::Result<ScheduleConfig> {
    Ok(ScheduleConfig {
        frequency: row.get("frequency")?,
        time_of_day: row.get("time_of_day")?,
        retention_days: row.get("retention_days")?,
        next_run_at: row.get("next_run_at")?,
    })
}

pub fn get(conn: &Connection) -> anyhow::Result<ScheduleConfig> {
    let mut stmt = conn.prepare("SELECT * FROM schedule_config WHERE id = 1")?;
    let mut rows = stmt.query_map([], |row| row_to_config(row))?;
    rows.next()
        .ok_or_else(|| anyhow::anyhow!("schedule_config row missing"))?
        .map_err(Into::into)
}

/// Reschedule. `next_run_at` is cleared so the Scheduler recomputes it
/// from the new cadence on its next tick.
pub fn set(
    conn: &Connection,
    frequency: &str,
    time_of_day: &str,
    retention_days: i64,
) -> anyhow::Result<ScheduleConfig> {
    conn.execute(
        "UPDATE schedule_config SET frequency = ?, time_of_day = ?, retention_days = ?, next_run_at = NULL
         WHERE id = 1",
        params![frequency, time_of_day, retention_days],
    )?;
    get(conn)
}

pub fn set_next_run_at(conn: &Connection, next_run_at: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE schedule_config SET next_run_at = ? WHERE id = 1",
        params![next_run_at],
    )?;
    Ok(())
}
