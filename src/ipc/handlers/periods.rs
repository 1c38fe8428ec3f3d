use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = opt_str(req, key) else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(d) => Ok(Some(d.format("%Y-%m-%d").to_string())),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a YYYY-MM-DD date", key),
            Some(json!({ key: raw })),
        )),
    }
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, start_date, end_date, active
         FROM periods
         ORDER BY start_date DESC, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let start: Option<String> = row.get(2)?;
            let end: Option<String> = row.get(3)?;
            let active: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "startDate": start,
                "endDate": end,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(periods) => ok(&req.id, json!({ "periods": periods })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_periods_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match parse_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match parse_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let (Some(s), Some(e2)) = (&start, &end) {
        if s > e2 {
            return err(&req.id, "bad_params", "startDate must not be after endDate", None);
        }
    }

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM periods WHERE name = ?", [&name], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "period already exists",
            Some(json!({ "name": name })),
        );
    }

    let period_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO periods(id, name, start_date, end_date, active) VALUES(?, ?, ?, ?, 0)",
        (&period_id, &name, &start, &end),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "periods" })),
        );
    }

    ok(&req.id, json!({ "periodId": period_id, "name": name }))
}

fn handle_periods_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match parse_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match parse_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let (Some(s), Some(e2)) = (&start, &end) {
        if s > e2 {
            return err(&req.id, "bad_params", "startDate must not be after endDate", None);
        }
    }

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM periods WHERE name = ? AND id != ?",
            [&name, &period_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "conflict",
            "another period already uses this name",
            Some(json!({ "name": name })),
        );
    }

    match conn.execute(
        "UPDATE periods SET name = ?, start_date = ?, end_date = ? WHERE id = ?",
        (&name, &start, &end, &period_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "period not found", None),
        Ok(_) => ok(&req.id, json!({ "periodId": period_id, "name": name })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

/// At most one period is active; activation deactivates the rest in the
/// same transaction.
fn handle_periods_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM periods WHERE id = ?", [&period_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "period not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("UPDATE periods SET active = 0 WHERE active = 1", []) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("UPDATE periods SET active = 1 WHERE id = ?", [&period_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "periodId": period_id, "active": true }))
}

fn handle_periods_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE period_id = ?
             UNION ALL
             SELECT 1 FROM assignments WHERE period_id = ?
             LIMIT 1",
            [&period_id, &period_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(
            &req.id,
            "conflict",
            "period has enrollments or assignments",
            None,
        );
    }

    match conn.execute("DELETE FROM periods WHERE id = ?", [&period_id]) {
        Ok(0) => err(&req.id, "not_found", "period not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "periods.list" => Some(handle_periods_list(state, req)),
        "periods.create" => Some(handle_periods_create(state, req)),
        "periods.update" => Some(handle_periods_update(state, req)),
        "periods.activate" => Some(handle_periods_activate(state, req)),
        "periods.delete" => Some(handle_periods_delete(state, req)),
        _ => None,
    }
}
