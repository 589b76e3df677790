//! SQL text helpers
//!
//! DDL statements cannot take bind parameters, so every identifier and literal
//! that reaches PostgreSQL goes through one of the quoting functions here.

/// Maximum identifier length PostgreSQL keeps (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Quote a SQL identifier
///
/// - `my_table` -> `"my_table"`
/// - `table"name` -> `"table""name"`
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal
///
/// - `hello` -> `'hello'`
/// - `it's` -> `'it''s'`
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate a name before it is used as a quoted identifier
///
/// Quoting handles any character except NUL; PostgreSQL silently truncates
/// names longer than 63 bytes, which would make the catalog comparison miss.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_IDENTIFIER_LEN && !name.contains('\0')
}

/// Validate a configuration parameter name for `ALTER ROLE ... SET`
///
/// Accepts plain (`work_mem`) and custom (`app.tenant_id`) parameter names.
pub fn is_valid_setting_name(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
    }
    parts <= 2
}

/// Settings PostgreSQL treats as lists (`GUC_LIST_QUOTE`)
///
/// Each item is stored identifier-quoted when needed, so `$user, public` comes
/// back from `pg_db_role_setting` as `"$user", public`.
const LIST_SETTINGS: &[&str] = &[
    "search_path",
    "temp_tablespaces",
    "local_preload_libraries",
    "session_preload_libraries",
    "shared_preload_libraries",
    "unix_socket_directories",
];

pub fn is_list_setting(name: &str) -> bool {
    LIST_SETTINGS.contains(&name)
}

/// Split a list setting into its items
///
/// Commas inside double quotes do not separate items. Surrounding quotes are
/// removed and doubled quotes inside them unescaped.
pub fn split_setting_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' => quoted = true,
            ',' if !quoted => items.push(finish_item(&mut current)),
            c => current.push(c),
        }
    }
    items.push(finish_item(&mut current));
    items
}

fn finish_item(current: &mut String) -> String {
    std::mem::take(current).trim().to_string()
}

/// Canonical form of a setting value for comparison
///
/// List settings become their unquoted items joined with `, `; every other
/// value is returned as is.
pub fn normalize_setting_value(name: &str, value: &str) -> String {
    if is_list_setting(name) {
        split_setting_list(value).join(", ")
    } else {
        value.to_string()
    }
}

/// Right-hand side of `SET name = ...`
///
/// List settings send one literal per item; anything else is a single
/// literal.
pub fn setting_value_sql(name: &str, value: &str) -> String {
    if is_list_setting(name) {
        split_setting_list(value)
            .iter()
            .map(|item| quote_literal(item))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        quote_literal(value)
    }
}

/// Match an object name against a pattern where `*` matches any run of characters
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return false;
    };
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &name[first.len()..];
    let inner = segments.len().saturating_sub(1);
    for segment in segments.iter().take(inner).skip(1) {
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Generate a secure random password
pub fn generate_password() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";
    const PASSWORD_LEN: usize = 32;

    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .filter_map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET.get(idx).map(|&c| c as char)
        })
        .collect()
}
