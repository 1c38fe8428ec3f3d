use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "habilidades.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS careers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            name_norm TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cycles(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            name_norm TEXT NOT NULL UNIQUE,
            ordinal INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS curricular_units(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            name_norm TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            career_id TEXT NOT NULL,
            cycle_id TEXT NOT NULL,
            curricular_unit_id TEXT NOT NULL,
            FOREIGN KEY(career_id) REFERENCES careers(id),
            FOREIGN KEY(cycle_id) REFERENCES cycles(id),
            FOREIGN KEY(curricular_unit_id) REFERENCES curricular_units(id),
            UNIQUE(name_norm, career_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_career ON subjects(career_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            cedula TEXT NOT NULL UNIQUE,
            first_names TEXT NOT NULL,
            last_names TEXT NOT NULL,
            email TEXT,
            career TEXT,
            cycle TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            cedula TEXT NOT NULL UNIQUE,
            first_names TEXT NOT NULL,
            last_names TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            career_id TEXT,
            FOREIGN KEY(career_id) REFERENCES careers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skills(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            name_norm TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_activities(
            id TEXT PRIMARY KEY,
            skill_id TEXT NOT NULL,
            description TEXT NOT NULL,
            FOREIGN KEY(skill_id) REFERENCES skills(id),
            UNIQUE(skill_id, description)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_activities_skill ON skill_activities(skill_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT,
            active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            cycle_id TEXT NOT NULL,
            paralelo TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            FOREIGN KEY(cycle_id) REFERENCES cycles(id),
            UNIQUE(student_id, period_id, paralelo)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_period ON enrollments(period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            paralelo TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            UNIQUE(subject_id, period_id, paralelo)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_period ON assignments(period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_user ON assignments(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plannings(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            parcial INTEGER NOT NULL,
            created_at TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, parcial)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS planning_skills(
            planning_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            PRIMARY KEY(planning_id, skill_id),
            FOREIGN KEY(planning_id) REFERENCES plannings(id),
            FOREIGN KEY(skill_id) REFERENCES skills(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            planning_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            score REAL NOT NULL,
            remark TEXT,
            updated_at TEXT,
            FOREIGN KEY(planning_id) REFERENCES plannings(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(skill_id) REFERENCES skills(id),
            UNIQUE(planning_id, student_id, skill_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_planning ON evaluations(planning_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_student ON evaluations(student_id)",
        [],
    )?;

    // Older workspaces predate the remark column on evaluations.
    ensure_evaluations_remark(&conn)?;

    Ok(conn)
}

fn ensure_evaluations_remark(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "evaluations", "remark")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE evaluations ADD COLUMN remark TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
