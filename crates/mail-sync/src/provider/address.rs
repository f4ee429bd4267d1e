//! Address-list parsing for raw `From`/`To`/`Cc` header values

use crate::models::EmailAddress;

/// Parse a comma-separated address list.
///
/// Commas inside a quoted display name or inside `<...>` do not split, and
/// backslash escapes inside quotes are honoured. Entries without an address
/// are dropped.
pub fn parse_address_list(header: &str) -> Vec<EmailAddress> {
    split_addresses(header)
        .iter()
        .filter_map(|entry| EmailAddress::parse(entry))
        .filter(|addr| addr.email.contains('@'))
        .collect()
}

/// Parse a header that carries exactly one address (e.g. `From`)
pub fn parse_single_address(header: &str) -> Option<EmailAddress> {
    parse_address_list(header).into_iter().next()
}

fn split_addresses(header: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut angle_depth = 0u32;
    let mut chars = header.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                angle_depth += 1;
                current.push(c);
            }
            '>' if !in_quotes => {
                angle_depth = angle_depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !in_quotes && angle_depth == 0 => {
                entries.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    entries.push(current);

    entries
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_comma_does_not_split() {
        let list = parse_address_list(r#""Doe, John" <john@example.com>, jane@example.com"#);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name.as_deref(), Some("Doe, John"));
        assert_eq!(list[0].email, "john@example.com");
        assert_eq!(list[1].email, "jane@example.com");
    }

    #[test]
    fn test_escaped_quote_inside_name() {
        let list = parse_address_list(r#""A \"B, C\" D" <abcd@example.com>, x@example.com"#);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name.as_deref(), Some(r#"A "B, C" D"#));
    }

    #[test]
    fn test_mixed_forms_and_empty_entries() {
        let list = parse_address_list(" Alice <ALICE@Example.com>, , <bob@example.com>,carol@example.com, ");
        let emails: Vec<_> = list.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(
            emails,
            vec!["alice@example.com", "bob@example.com", "carol@example.com"]
        );
    }

    #[test]
    fn test_undisclosed_recipients_dropped() {
        assert!(parse_address_list("undisclosed-recipients:;").is_empty());
        assert!(parse_address_list("").is_empty());
    }

    #[test]
    fn test_single_address() {
        let from = parse_single_address("Mailer <noreply@example.com>").unwrap();
        assert_eq!(from.email, "noreply@example.com");
        assert!(parse_single_address("").is_none());
    }
}
