use rusqlite::{params, Connection, OptionalExtension};

use crate::common::error::Result;
use crate::domain::Source;

/// Sources are static reference data; seeding is an upsert so config
/// changes take effect on the next run.
pub fn upsert_source(conn: &Connection, source: &Source) -> Result<()> {
    conn.execute(
        "INSERT INTO sources (id, name, base_url) VALUES (?1, ?2, ?3) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, base_url = excluded.base_url",
        params![source.id, source.name, source.base_url],
    )?;
    Ok(())
}

pub fn get_source(conn: &Connection, id: &str) -> Result<Option<Source>> {
    let source = conn
        .query_row(
            "SELECT id, name, base_url FROM sources WHERE id = ?1",
            params![id],
            |row| {
                Ok(Source {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    base_url: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(source)
}

pub fn list_sources(conn: &Connection) -> Result<Vec<Source>> {
    let mut stmt = conn.prepare("SELECT id, name, base_url FROM sources ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(Source {
            id: row.get(0)?,
            name: row.get(1)?,
            base_url: row.get(2)?,
        })
    })?;
    let mut sources = Vec::new();
    for row in rows {
        sources.push(row?);
    }
    Ok(sources)
}
