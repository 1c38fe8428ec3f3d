//! Shared plumbing for the bulk CSV importers: text normalization,
//! delimiter detection and quote-aware row parsing.
//!
//! Uploaded rosters come from hand-edited spreadsheets, so free-text
//! names arrive in inconsistent casing and curricular cycles arrive as
//! either Arabic digits or badly-cased Roman numerals. Everything is
//! normalized once here and every catalog lookup goes through the
//! pre-normalized key form.

/// Canonical Roman numerals for cycles I through X, index 0 = I.
const ROMANS: [&str; 10] = ["I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X"];

/// Normalizes one free-text value word by word: Arabic 1-10 becomes the
/// Roman numeral, a badly-cased Roman numeral becomes its canonical
/// uppercase form, anything else is title-cased. Blank input yields an
/// empty string. Idempotent.
pub fn normalize_text(raw: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    for word in raw.split_whitespace() {
        words.push(normalize_word(word));
    }
    words.join(" ")
}

fn normalize_word(word: &str) -> String {
    if let Ok(n) = word.parse::<usize>() {
        if (1..=10).contains(&n) {
            return ROMANS[n - 1].to_string();
        }
    }
    let upper: String = word
        .chars()
        .flat_map(|c| c.to_uppercase())
        .collect();
    if ROMANS.contains(&upper.as_str()) {
        return upper;
    }
    title_case(word)
}

fn title_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    for c in chars {
        out.extend(c.to_lowercase());
    }
    out
}

/// Lookup key form: case-folded with whitespace collapsed. Stored in the
/// `name_norm` columns so catalog resolution is an exact index match
/// instead of a substring scan.
pub fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| w.chars().flat_map(|c| c.to_lowercase()).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ordinal rank of a cycle name, I=1 through X=10. Accepts any casing.
pub fn roman_ordinal(name: &str) -> Option<u32> {
    let upper: String = name.trim().chars().flat_map(|c| c.to_uppercase()).collect();
    ROMANS
        .iter()
        .position(|r| *r == upper)
        .map(|i| (i + 1) as u32)
}

/// Picks `;` or `,` by counting both on the first non-blank line.
/// Semicolon wins only when strictly more frequent; comma is the default.
pub fn detect_delimiter(content: &str) -> char {
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let semis = line.matches(';').count();
        let commas = line.matches(',').count();
        return if semis > commas { ';' } else { ',' };
    }
    ','
}

/// One parsed data row. `fila` is the 1-based position among data rows
/// (blank and header lines excluded), matching the row numbers quoted in
/// import error messages.
#[derive(Debug, Clone)]
pub struct Row {
    pub fila: usize,
    pub fields: Vec<String>,
}

/// Header tokens recognized (case- and accent-insensitively) in the
/// first column. Exported spreadsheets usually keep their header row.
const HEADER_TOKENS: [&str; 3] = ["nombre", "cedula", "identificacion"];

/// Splits raw upload text into data rows. Tolerates mixed line endings
/// and a UTF-8 BOM, drops blank lines, drops a header row, and drops
/// rows whose fields are all empty after trimming.
pub fn parse_rows(content: &str, delimiter: char) -> Vec<Row> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut rows: Vec<Row> = Vec::new();
    for line in content.split(['\r', '\n']) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<String> = split_record(line, delimiter)
            .into_iter()
            .map(|f| f.trim().to_string())
            .collect();
        if fields.iter().all(|f| f.is_empty()) {
            continue;
        }
        if is_header_field(&fields[0]) {
            continue;
        }
        rows.push(Row {
            fila: rows.len() + 1,
            fields,
        });
    }
    rows
}

fn is_header_field(field: &str) -> bool {
    let folded: String = field
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            other => other,
        })
        .collect();
    HEADER_TOKENS.contains(&folded.as_str())
}

/// Standard CSV quoting rules at the given delimiter: quoted fields may
/// contain the delimiter, doubled quotes escape a literal quote.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == delimiter && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

/// Running totals for one bulk import. Row-level problems land in
/// `errores`; they never abort the rest of the file.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub creados: i64,
    pub actualizados: i64,
    pub errores: Vec<String>,
}

impl ImportSummary {
    pub fn error(&mut self, fila: usize, message: impl Into<String>) {
        self.errores.push(format!("Fila {}: {}", fila, message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_title_cases_each_word() {
        assert_eq!(normalize_text("  unidad  BÁSICA "), "Unidad Básica");
        assert_eq!(normalize_text("desarrollo de software"), "Desarrollo De Software");
    }

    #[test]
    fn normalize_maps_arabic_to_roman() {
        assert_eq!(normalize_text("1"), "I");
        assert_eq!(normalize_text("4"), "IV");
        assert_eq!(normalize_text("10"), "X");
        assert_eq!(normalize_text("11"), "11");
        assert_eq!(normalize_text("0"), "0");
    }

    #[test]
    fn normalize_fixes_roman_casing() {
        assert_eq!(normalize_text("Ii"), "II");
        assert_eq!(normalize_text("viii"), "VIII");
        assert_eq!(normalize_text("ix"), "IX");
    }

    #[test]
    fn normalize_is_idempotent() {
        for t in ["", "  ", "programación I", "3", "Viii", "unidad básica", "TI"] {
            let once = normalize_text(t);
            assert_eq!(normalize_text(&once), once, "input {:?}", t);
        }
    }

    #[test]
    fn normalize_blank_yields_empty() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn key_folds_case_and_whitespace() {
        assert_eq!(normalize_key("  Unidad   BÁSICA "), "unidad básica");
        assert_eq!(normalize_key("Software"), normalize_key("SOFTWARE"));
    }

    #[test]
    fn roman_ordinals() {
        assert_eq!(roman_ordinal("I"), Some(1));
        assert_eq!(roman_ordinal("iii"), Some(3));
        assert_eq!(roman_ordinal("X"), Some(10));
        assert_eq!(roman_ordinal("XI"), None);
        assert_eq!(roman_ordinal("Primero"), None);
    }

    #[test]
    fn delimiter_prefers_strict_semicolon_majority() {
        assert_eq!(detect_delimiter("a;b;c;d,e"), ';');
        assert_eq!(detect_delimiter("a;b,c,d,e"), ',');
        // Tie defaults to comma.
        assert_eq!(detect_delimiter("a;b,c"), ',');
        assert_eq!(detect_delimiter("\n\n  \nx;y;z"), ';');
        assert_eq!(detect_delimiter(""), ',');
    }

    #[test]
    fn parse_skips_blank_and_header_lines() {
        let content = "\nNombre,Carrera,Ciclo,Unidad\nProgramación,Software,1,Unidad Básica\n";
        let rows = parse_rows(content, ',');
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fila, 1);
        assert_eq!(rows[0].fields[0], "Programación");
    }

    #[test]
    fn parse_recognizes_accented_header() {
        let rows = parse_rows("Cédula;Nombres;Apellidos\n0926687856;Ana;Mora\n", ';');
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields[0], "0926687856");
    }

    #[test]
    fn parse_handles_quoted_fields() {
        let rows = parse_rows("\"Redes, Avanzado\",TI,2,\"Unidad \"\"Pro\"\"\"\n", ',');
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields[0], "Redes, Avanzado");
        assert_eq!(rows[0].fields[3], "Unidad \"Pro\"");
    }

    #[test]
    fn parse_drops_rows_with_only_empty_fields() {
        let rows = parse_rows(",,,\n;;;\nProgramación,Software,1,Unidad Básica\n", ',');
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn parse_tolerates_mixed_line_endings_and_bom() {
        let content = "\u{feff}Uno,A\r\nDos,B\rTres,C\n";
        let rows = parse_rows(content, ',');
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].fila, 3);
    }

    #[test]
    fn summary_formats_row_errors() {
        let mut s = ImportSummary::default();
        s.error(1, "Ciclo 'I' inválido para 'Programación'.");
        assert_eq!(s.errores, vec!["Fila 1: Ciclo 'I' inválido para 'Programación'."]);
    }
}
