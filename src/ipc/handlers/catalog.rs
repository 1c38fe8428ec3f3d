use crate::importer;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_careers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           (SELECT COUNT(*) FROM subjects s WHERE s.career_id = c.id) AS subject_count
         FROM careers c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let subject_count: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "subjectCount": subject_count }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(careers) => ok(&req.id, json!({ "careers": careers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_careers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let name_norm = importer::normalize_key(&name);

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM careers WHERE name_norm = ?",
            [&name_norm],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "career already exists",
            Some(json!({ "name": name })),
        );
    }

    let career_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO careers(id, name, name_norm) VALUES(?, ?, ?)",
        (&career_id, &name, &name_norm),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "careers" })),
        );
    }

    ok(&req.id, json!({ "careerId": career_id, "name": name }))
}

fn handle_careers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let career_id = match required_str(req, "careerId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM subjects WHERE career_id = ?
             UNION ALL
             SELECT 1 FROM users WHERE career_id = ?
             LIMIT 1",
            [&career_id, &career_id],
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
            "career is referenced by subjects or users",
            None,
        );
    }

    match conn.execute("DELETE FROM careers WHERE id = ?", [&career_id]) {
        Ok(0) => err(&req.id, "not_found", "career not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn handle_cycles_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare("SELECT id, name, ordinal FROM cycles ORDER BY ordinal") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let ordinal: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "ordinal": ordinal }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(cycles) => ok(&req.id, json!({ "cycles": cycles })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_cycles_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let Some(ordinal) = importer::roman_ordinal(&name) else {
        return err(
            &req.id,
            "bad_params",
            "cycle name must be a Roman numeral I through X",
            Some(json!({ "name": name })),
        );
    };
    let name_norm = importer::normalize_key(&name);

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM cycles WHERE name_norm = ?",
            [&name_norm],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "cycle already exists",
            Some(json!({ "name": name })),
        );
    }

    let cycle_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO cycles(id, name, name_norm, ordinal) VALUES(?, ?, ?, ?)",
        (&cycle_id, &name, &name_norm, ordinal as i64),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "cycles" })),
        );
    }

    ok(
        &req.id,
        json!({ "cycleId": cycle_id, "name": name, "ordinal": ordinal }),
    )
}

fn handle_units_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM curricular_units ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(units) => ok(&req.id, json!({ "units": units })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_units_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => importer::normalize_text(&v),
        Err(e) => return e,
    };
    let name_norm = importer::normalize_key(&name);

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM curricular_units WHERE name_norm = ?",
            [&name_norm],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "curricular unit already exists",
            Some(json!({ "name": name })),
        );
    }

    let unit_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO curricular_units(id, name, name_norm) VALUES(?, ?, ?)",
        (&unit_id, &name, &name_norm),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "curricular_units" })),
        );
    }

    ok(&req.id, json!({ "unitId": unit_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "careers.list" => Some(handle_careers_list(state, req)),
        "careers.create" => Some(handle_careers_create(state, req)),
        "careers.delete" => Some(handle_careers_delete(state, req)),
        "cycles.list" => Some(handle_cycles_list(state, req)),
        "cycles.create" => Some(handle_cycles_create(state, req)),
        "units.list" => Some(handle_units_list(state, req)),
        "units.create" => Some(handle_units_create(state, req)),
        _ => None,
    }
}
