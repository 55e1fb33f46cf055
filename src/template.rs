//! Recipient message template rendering.
//!
//! A campaign template is a plain string carrying `{placeholder}` markers.
//! Three are built in (`name`, `phone`, `amount`); everything else is
//! resolved from the recipient's own spreadsheet row, keyed by column
//! header. An unresolved placeholder renders as the empty string rather
//! than failing the send — a malformed header should never block a whole
//! campaign.

use crate::domain_types::format_amount_thousands;
use std::collections::HashMap;

/// A single campaign recipient and the fields available to its template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Destination phone number, as provided (not yet normalised).
    pub phone: String,
    /// Display name, if a `name` column was present.
    pub name: Option<String>,
    /// Amount associated with this recipient, in minor-unit-free whole
    /// numbers (e.g. whole shillings), if an `amount` column was present.
    pub amount: Option<i64>,
    /// Every other spreadsheet column, header to cell value.
    pub fields: HashMap<String, String>,
}

impl Recipient {
    /// Builds a recipient with no extra fields.
    #[must_use]
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: None,
            amount: None,
            fields: HashMap::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the amount.
    #[must_use]
    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Adds a dynamic field resolved by `{header}`.
    #[must_use]
    pub fn with_field(mut self, header: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(header.into(), value.into());
        self
    }

    fn resolve(&self, placeholder: &str) -> String {
        match placeholder {
            "name" => self.name.clone().unwrap_or_default(),
            "phone" => self.phone.clone(),
            "amount" => self.amount.map(format_amount_thousands).unwrap_or_default(),
            other => self.fields.get(other).cloned().unwrap_or_default(),
        }
    }
}

/// Expands every `{placeholder}` in `template` against `recipient`.
///
/// Braces that don't close, or nest, are copied through verbatim — the
/// template author is expected to write well-formed placeholders, but a
/// stray `{` must never panic or corrupt the rest of the body.
#[must_use]
pub fn render(template: &str, recipient: &Recipient) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices();

    while let Some((i, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        if let Some(end) = template[i + 1..].find('}') {
            let placeholder = &template[i + 1..i + 1 + end];
            if placeholder.chars().all(|pc| pc.is_ascii_alphanumeric() || pc == '_') && !placeholder.is_empty() {
                out.push_str(&recipient.resolve(placeholder));
                for _ in 0..=end {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_render_builtin_placeholders() {
        let recipient = Recipient::new("+254700000001").with_name("Asha").with_amount(15_000);
        let rendered = render("Hi {name}, your balance is KES {amount} ({phone})", &recipient);
        assert_eq!(rendered, "Hi Asha, your balance is KES 15,000 (+254700000001)");
    }

    #[test]
    fn test_should_render_dynamic_header_placeholders() {
        let recipient = Recipient::new("+254700000002").with_field("plan", "Gold");
        assert_eq!(render("Plan: {plan}", &recipient), "Plan: Gold");
    }

    #[test]
    fn test_should_render_empty_string_for_unknown_placeholder() {
        let recipient = Recipient::new("+254700000003");
        assert_eq!(render("Hello {mystery}!", &recipient), "Hello !");
    }

    #[test]
    fn test_should_pass_through_unclosed_brace_verbatim() {
        let recipient = Recipient::new("+254700000004");
        assert_eq!(render("price: { not closed", &recipient), "price: { not closed");
    }

    #[test]
    fn test_should_render_empty_string_when_amount_missing() {
        let recipient = Recipient::new("+254700000005");
        assert_eq!(render("Amount: {amount}", &recipient), "Amount: ");
    }
}
