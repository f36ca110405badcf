// Per-channel rendering of notifications

use super::Notification;
use crate::monitoring::alerts::Severity;
use serde_json::{json, Value};

/// Maximum SMS body length
pub const SMS_MAX_LEN: usize = 160;

/// Presentation attributes derived from severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityStyle {
    pub color: &'static str,
    pub label: &'static str,
    pub urgency: &'static str,
}

pub fn style(severity: Severity) -> SeverityStyle {
    match severity {
        Severity::Low => SeverityStyle {
            color: "#2eb886",
            label: "LOW",
            urgency: "informational",
        },
        Severity::Medium => SeverityStyle {
            color: "#daa038",
            label: "MEDIUM",
            urgency: "attention",
        },
        Severity::High => SeverityStyle {
            color: "#e8702a",
            label: "HIGH",
            urgency: "urgent",
        },
        Severity::Critical => SeverityStyle {
            color: "#d00000",
            label: "CRITICAL",
            urgency: "immediate action required",
        },
    }
}

pub fn email_subject(notification: &Notification) -> String {
    format!("[{}] {}", style(notification.severity).label, notification.title)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// HTML email body with a severity-colored header and a details block
pub fn email_html(notification: &Notification) -> String {
    let style = style(notification.severity);
    let details = notification
        .data
        .as_ref()
        .and_then(|d| serde_json::to_string_pretty(d).ok())
        .map(|d| format!("<pre style=\"background:#f4f4f4;padding:12px\">{}</pre>", escape_html(&d)))
        .unwrap_or_default();

    format!(
        "<html><body style=\"font-family:sans-serif\">\
         <div style=\"background:{color};color:#fff;padding:12px\">\
         <strong>{label}</strong> &middot; {urgency}</div>\
         <h2>{title}</h2><p>{message}</p>{details}\
         <p style=\"color:#888;font-size:12px\">Raised at {created}</p>\
         </body></html>",
        color = style.color,
        label = style.label,
        urgency = style.urgency,
        title = escape_html(&notification.title),
        message = escape_html(&notification.message),
        details = details,
        created = notification.created_at.to_rfc3339(),
    )
}

/// Plain-text alternative for mail clients without HTML
pub fn email_text(notification: &Notification) -> String {
    format!(
        "{}\n\n{}\n\nSeverity: {} ({})\nRaised at: {}",
        notification.title,
        notification.message,
        style(notification.severity).label,
        style(notification.severity).urgency,
        notification.created_at.to_rfc3339()
    )
}

/// Card-formatted chat message with a colored attachment
pub fn chat_card(notification: &Notification) -> Value {
    let style = style(notification.severity);
    let mut fields = vec![json!({
        "title": "Severity",
        "value": style.label,
        "short": true,
    })];
    if let Some(alert_id) = notification.alert_id {
        fields.push(json!({
            "title": "Alert",
            "value": alert_id.to_string(),
            "short": true,
        }));
    }

    json!({
        "text": notification.title,
        "attachments": [{
            "color": style.color,
            "title": notification.title,
            "text": notification.message,
            "fields": fields,
            "footer": style.urgency,
            "ts": notification.created_at.timestamp(),
        }]
    })
}

/// Short text message truncated to `SMS_MAX_LEN` characters
pub fn sms_text(notification: &Notification) -> String {
    let text = format!("[{}] {}", style(notification.severity).label, notification.message);
    if text.chars().count() <= SMS_MAX_LEN {
        return text;
    }
    let mut truncated: String = text.chars().take(SMS_MAX_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}

/// Raw JSON payload for webhooks
pub fn webhook_payload(notification: &Notification) -> Value {
    json!({
        "alert_id": notification.alert_id,
        "severity": notification.severity,
        "title": notification.title,
        "message": notification.message,
        "data": notification.data,
        "created_at": notification.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(severity: Severity, message: &str) -> Notification {
        Notification::new(severity, "High error rate", message)
    }

    #[test]
    fn test_severity_colors_differ() {
        let colors: std::collections::HashSet<_> = [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
        .into_iter()
        .map(|s| style(s).color)
        .collect();
        assert_eq!(colors.len(), 4);
    }

    #[test]
    fn test_sms_is_truncated() {
        let long = "x".repeat(400);
        let text = sms_text(&notification(Severity::High, &long));
        assert_eq!(text.chars().count(), SMS_MAX_LEN);
        assert!(text.ends_with("..."));

        let short = sms_text(&notification(Severity::Low, "ok"));
        assert_eq!(short, "[LOW] ok");
    }

    #[test]
    fn test_email_html_escapes_content() {
        let html = email_html(&notification(Severity::Critical, "<script>alert(1)</script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("#d00000"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_chat_card_carries_color() {
        let card = chat_card(&notification(Severity::Medium, "slow"));
        assert_eq!(card["attachments"][0]["color"], "#daa038");
        assert_eq!(card["attachments"][0]["text"], "slow");
    }

    #[test]
    fn test_webhook_payload_is_raw_notification() {
        let payload = webhook_payload(&notification(Severity::High, "boom"));
        assert_eq!(payload["severity"], "high");
        assert_eq!(payload["message"], "boom");
    }
}
