//! Reader for TFS ("table file system") files written by the engine.
//!
//! Layout:
//! ```text
//! @ NAME             %08s "TWISS"
//! @ Q1               %le  0.31
//! * NAME             S          BETX
//! $ %s               %le        %le
//!  "START"           0          2.5
//! ```
//! Header and column names are lower-cased.

use madx_model_types::{Summary, Table, Value};

#[derive(Debug, thiserror::Error)]
pub enum TfsError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("table has no column line")]
    MissingColumns,
}

fn syntax(line: usize, message: impl Into<String>) -> TfsError {
    TfsError::Syntax {
        line,
        message: message.into(),
    }
}

/// Parse a TFS document into a table and its summary.
pub fn parse(text: &str) -> Result<(Table, Summary), TfsError> {
    let mut summary = Summary::new();
    let mut columns: Option<Vec<String>> = None;
    let mut types: Vec<String> = Vec::new();
    let mut rows = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens = tokenize(line).map_err(|m| syntax(lineno, m))?;
        match tokens[0].as_str() {
            "@" => {
                if tokens.len() < 3 {
                    return Err(syntax(lineno, "header needs a name and a type"));
                }
                let name = tokens[1].to_ascii_lowercase();
                let raw_value = tokens.get(3).map(String::as_str).unwrap_or("");
                summary.insert(name, convert(&tokens[2], raw_value).map_err(|m| syntax(lineno, m))?);
            }
            "*" => {
                columns = Some(tokens[1..].iter().map(|c| c.to_ascii_lowercase()).collect());
            }
            "$" => {
                types = tokens[1..].to_vec();
            }
            _ => {
                let cols = columns.as_ref().ok_or(TfsError::MissingColumns)?;
                if tokens.len() != cols.len() {
                    return Err(syntax(
                        lineno,
                        format!("expected {} fields, found {}", cols.len(), tokens.len()),
                    ));
                }
                let row = tokens
                    .iter()
                    .enumerate()
                    .map(|(i, tok)| {
                        let ty = types.get(i).map(String::as_str).unwrap_or("%le");
                        convert(ty, tok)
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|m| syntax(lineno, m))?;
                rows.push(row);
            }
        }
    }

    let columns = columns.ok_or(TfsError::MissingColumns)?;
    Ok((Table { columns, rows }, summary))
}

fn convert(ty: &str, raw: &str) -> Result<Value, String> {
    if ty.ends_with('s') {
        return Ok(Value::Text(raw.to_string()));
    }
    if ty.ends_with("le") || ty.ends_with("lf") || ty.ends_with('d') {
        return raw
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| format!("'{raw}' is not a number ({ty})"));
    }
    Err(format!("unsupported type '{ty}'"))
}

/// Split on whitespace, keeping double-quoted strings whole (quotes removed).
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if ch == '"' {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                token.push(c);
            }
            if !closed {
                return Err("unterminated string".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}
