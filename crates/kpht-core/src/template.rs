//! Key lists that combine several entry fields into one string.
//!
//! A key list is either a single field name (`["password"]`) or a template
//! followed by the field names to substitute (`["%s (%s)", "name", "login"]`).
//! Templates understand `%s` and `%v` (substitute the next value) and `%%`
//! (a literal percent sign). Any other `%` sequence is copied verbatim.
//! A placeholder without a value renders as nothing; surplus values are
//! ignored.

/// Render `keys`, resolving each field name with `resolve`.
///
/// - no keys: empty string
/// - one key: `resolve(key)`
/// - more: `keys[0]` is a template, `keys[1..]` are resolved and substituted
pub fn combine<S, F>(keys: &[S], resolve: F) -> String
where
    S: AsRef<str>,
    F: Fn(&str) -> String,
{
    match keys {
        [] => String::new(),
        [key] => resolve(key.as_ref()),
        [template, fields @ ..] => {
            let values: Vec<String> = fields.iter().map(|f| resolve(f.as_ref())).collect();
            sprintf(template.as_ref(), &values)
        }
    }
}

/// Render `keys` with the field names themselves as values.
///
/// `["%s (%s)", "name", "login"]` becomes `"name (login)"`.
pub fn format_keys<S: AsRef<str>>(keys: &[S]) -> String {
    combine(keys, str::to_string)
}

/// Substitute `values` into the `%s`/`%v` placeholders of `template`.
pub fn sprintf<S: AsRef<str>>(template: &str, values: &[S]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('s') | Some('v') => {
                chars.next();
                if let Some(value) = values.next() {
                    out.push_str(value.as_ref());
                }
            }
            _ => out.push('%'),
        }
    }
    out
}
