const PATH_PLACEHOLDER: &str = "<path>";
const USERINFO_PLACEHOLDER: &str = "***";

/// Replace the userinfo part (`user:token@`) of every URL found in `text`.
#[must_use]
pub fn redact_url(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(scheme_end) = rest.find("://") {
        let authority_start = scheme_end + 3;
        out.push_str(&rest[..authority_start]);
        let after = &rest[authority_start..];
        let authority_len = after
            .find(|c: char| c == '/' || c.is_whitespace())
            .unwrap_or(after.len());
        let authority = &after[..authority_len];
        match authority.rfind('@') {
            Some(at) => {
                out.push_str(USERINFO_PLACEHOLDER);
                out.push_str(&authority[at..]);
            }
            None => out.push_str(authority),
        }
        rest = &after[authority_len..];
    }
    out.push_str(rest);
    out
}

/// Replace absolute filesystem paths in `text` with a placeholder.
#[must_use]
pub fn redact_paths(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for chunk in text.split_inclusive(char::is_whitespace) {
        let token = chunk.trim_end_matches(char::is_whitespace);
        let trailing_ws = &chunk[token.len()..];
        out.push_str(&redact_token(token));
        out.push_str(trailing_ws);
    }
    out
}

const fn is_opening(c: char) -> bool {
    matches!(c, '\'' | '"' | '(' | '[' | '`' | '{')
}

const fn is_closing(c: char) -> bool {
    matches!(c, '\'' | '"' | ')' | ']' | '`' | '}' | ',' | ':' | ';' | '.')
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim_start_matches(is_opening);
    if !trimmed.starts_with('/') || trimmed.len() < 2 {
        return token.to_owned();
    }
    let prefix = &token[..token.len() - trimmed.len()];
    let end = trimmed
        .char_indices()
        .rev()
        .find(|(_, c)| !is_closing(*c))
        .map_or(0, |(idx, c)| idx + c.len_utf8());
    format!("{prefix}{PATH_PLACEHOLDER}{}", &trimmed[end..])
}
