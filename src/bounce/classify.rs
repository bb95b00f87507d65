use mailparse::{parse_mail, MailHeaderMap, ParsedMail};

use regex::Regex;

use crate::domain::EmailAddress;
use crate::error::{Error, Result};
use crate::model::BounceKind;

/// One failed recipient reported by a bounce message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BouncedRecipient {
    pub email: EmailAddress,
    /// Status code reported by the remote server, e.g. `5.1.1`
    pub status_code: String,
    pub kind: BounceKind,
}

/// The classified content of one raw bounce message
#[derive(Debug, Clone)]
pub struct BounceReport {
    pub recipients: Vec<BouncedRecipient>,
    /// Subject of the returned original message when recoverable, otherwise
    /// the bounce message's own subject; input to issue correlation
    pub original_subject: String,
}

/// Classify a raw bounce message into its failed recipients.
///
/// Understands RFC 3464 `message/delivery-status` reports and falls back to
/// scanning plain-text bodies for Postfix-style `<addr>: reason` lines.
/// Fails closed: a message that yields no recipient is an error, never a
/// partial success.
pub fn parse_bounce_report(raw: &[u8]) -> Result<BounceReport> {
    let mail =
        parse_mail(raw).map_err(|e| Error::BounceClassification(e.to_string()))?;

    let mut recipients = Vec::new();
    collect_delivery_status(&mail, &mut recipients)?;
    if recipients.is_empty() {
        collect_text_fallback(&mail, &mut recipients)?;
    }
    if recipients.is_empty() {
        return Err(Error::BounceClassification(
            "no bounced recipients found in message".into(),
        ));
    }

    let original_subject = find_original_subject(&mail)
        .or_else(|| mail.headers.get_first_value("Subject"))
        .unwrap_or_default();

    Ok(BounceReport {
        recipients,
        original_subject,
    })
}

/// Hard if the reporting server said `failed` (or `hard`); everything else,
/// `delayed` included, is soft
fn kind_for_action(action: &str) -> BounceKind {
    let action = action.trim().to_ascii_lowercase();
    if action.contains("failed") || action.contains("hard") {
        BounceKind::Hard
    } else {
        BounceKind::Soft
    }
}

fn collect_delivery_status(
    part: &ParsedMail,
    recipients: &mut Vec<BouncedRecipient>,
) -> Result<()> {
    if matches!(
        part.ctype.mimetype.as_str(),
        "message/delivery-status" | "text/delivery-status"
    ) {
        let body = part
            .get_body()
            .map_err(|e| Error::BounceClassification(e.to_string()))?;
        parse_status_groups(&body, recipients);
    }
    for subpart in &part.subparts {
        collect_delivery_status(subpart, recipients)?;
    }
    Ok(())
}

/// A delivery-status body is a series of blank-line separated field groups;
/// each group carrying a `Final-Recipient` describes one failed address
fn parse_status_groups(body: &str, recipients: &mut Vec<BouncedRecipient>) {
    let body = body.replace("\r\n", "\n");
    for group in body.split("\n\n") {
        let mut email = None;
        let mut action = String::new();
        let mut status = None;
        let mut diagnostic = String::new();

        for line in group.lines() {
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match field.trim().to_ascii_lowercase().as_str() {
                "final-recipient" => email = address_of(value),
                "action" => action = value.to_string(),
                "status" => status = Some(value.to_string()),
                "diagnostic-code" => diagnostic = value.to_string(),
                _ => {}
            }
        }

        let Some(email) = email else { continue };
        let status_code = status
            .or_else(|| extract_enhanced_status(&diagnostic))
            .unwrap_or_else(|| "5.0.0".into());
        recipients.push(BouncedRecipient {
            email,
            status_code,
            kind: kind_for_action(&action),
        });
    }
}

/// `Final-Recipient: rfc822; user@example.com` — the address is whatever
/// follows the address-type token
fn address_of(value: &str) -> Option<EmailAddress> {
    let candidate = value.rsplit(';').next()?.trim();
    candidate.trim_matches(['<', '>'].as_slice()).parse().ok()
}

/// Pull a `c.s.d` enhanced status code out of free text
fn extract_enhanced_status(text: &str) -> Option<String> {
    lazy_static::lazy_static! {
        static ref ENHANCED_STATUS: Regex = Regex::new(r"\b([245])\.(\d{1,3})\.(\d{1,3})\b").unwrap();
    }

    ENHANCED_STATUS
        .captures(text)
        .map(|caps| caps[0].to_string())
}

/// Postfix-style reports without a structured part carry lines like
/// `<user@example.com>: host mx said: 550 5.1.1 user unknown`.
/// A permanent (5.x.x) code reads as a failed action; anything else is soft.
fn collect_text_fallback(
    part: &ParsedMail,
    recipients: &mut Vec<BouncedRecipient>,
) -> Result<()> {
    lazy_static::lazy_static! {
        static ref FAILED_LINE: Regex = Regex::new(r"(?m)^\s*<([^>\s]+@[^>\s]+)>:?\s*(.*)$").unwrap();
    }

    if part.ctype.mimetype.starts_with("text/") || part.subparts.is_empty() {
        let body = part
            .get_body()
            .map_err(|e| Error::BounceClassification(e.to_string()))?;
        for caps in FAILED_LINE.captures_iter(&body) {
            let Ok(email) = caps[1].parse::<EmailAddress>() else {
                continue;
            };
            let status_code =
                extract_enhanced_status(&caps[2]).unwrap_or_else(|| "4.0.0".into());
            let kind = if status_code.starts_with('5') {
                BounceKind::Hard
            } else {
                BounceKind::Soft
            };
            recipients.push(BouncedRecipient {
                email,
                status_code,
                kind,
            });
        }
    }
    for subpart in &part.subparts {
        collect_text_fallback(subpart, recipients)?;
    }
    Ok(())
}

/// The returned original message, attached as `message/rfc822` or
/// `text/rfc822-headers`, carries the subject the issue was sent under
fn find_original_subject(part: &ParsedMail) -> Option<String> {
    if matches!(
        part.ctype.mimetype.as_str(),
        "message/rfc822" | "text/rfc822-headers" | "message/rfc822-headers"
    ) {
        if let Some(embedded) = part.subparts.first() {
            if let Some(subject) = embedded.headers.get_first_value("Subject") {
                return Some(subject);
            }
        }
        if let Ok(raw) = part.get_body_raw() {
            if let Ok(embedded) = parse_mail(&raw) {
                if let Some(subject) = embedded.headers.get_first_value("Subject") {
                    return Some(subject);
                }
            }
        }
    }
    part.subparts.iter().find_map(find_original_subject)
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok};

    use super::*;

    fn delivery_status_report(action: &str, status: &str, subject: &str) -> String {
        format!(
            "From: MAILER-DAEMON@mail.example.com\r\n\
             To: bounces@news.example.com\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\
             Content-Type: multipart/report; report-type=delivery-status; boundary=\"BOUND\"\r\n\
             \r\n\
             --BOUND\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             This is the mail system at host mail.example.com.\r\n\
             --BOUND\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Reporting-MTA: dns; mail.example.com\r\n\
             \r\n\
             Final-Recipient: rfc822; u2@example.com\r\n\
             Action: {action}\r\n\
             Status: {status}\r\n\
             Diagnostic-Code: smtp; 550 5.1.1 user unknown\r\n\
             --BOUND\r\n\
             Content-Type: message/rfc822\r\n\
             \r\n\
             Subject: {subject}\r\n\
             From: news@example.com\r\n\
             To: u2@example.com\r\n\
             \r\n\
             Hello\r\n\
             --BOUND--\r\n"
        )
    }

    #[test]
    fn failed_action_classifies_as_hard() {
        let raw = delivery_status_report("failed", "5.1.1", "March News");
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!(1, report.recipients.len());
        let recipient = &report.recipients[0];
        assert_eq!("u2@example.com", recipient.email.as_ref());
        assert_eq!("5.1.1", recipient.status_code);
        assert_eq!(BounceKind::Hard, recipient.kind);
    }

    #[test]
    fn delayed_action_classifies_as_soft() {
        let raw = delivery_status_report("delayed", "4.4.1", "March News");
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!(BounceKind::Soft, report.recipients[0].kind);
        assert_eq!("4.4.1", report.recipients[0].status_code);
    }

    #[test]
    fn original_subject_is_taken_from_returned_message() {
        let raw = delivery_status_report("failed", "5.1.1", "March News");
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!("March News", report.original_subject);
    }

    #[test]
    fn multiple_recipient_groups_are_all_reported() {
        let raw = "From: MAILER-DAEMON@mail.example.com\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\
             Content-Type: multipart/report; report-type=delivery-status; boundary=\"B\"\r\n\
             \r\n\
             --B\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Reporting-MTA: dns; mail.example.com\r\n\
             \r\n\
             Final-Recipient: rfc822; a@example.com\r\n\
             Action: failed\r\n\
             Status: 5.1.1\r\n\
             \r\n\
             Final-Recipient: rfc822; b@example.com\r\n\
             Action: delayed\r\n\
             Status: 4.2.2\r\n\
             --B--\r\n";
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!(2, report.recipients.len());
        assert_eq!(BounceKind::Hard, report.recipients[0].kind);
        assert_eq!(BounceKind::Soft, report.recipients[1].kind);
    }

    #[test]
    fn plain_text_postfix_report_is_scanned_as_fallback() {
        let raw = "From: MAILER-DAEMON@mail.example.com\r\n\
             Subject: Mail delivery failed\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             I'm sorry to have to inform you that your message could not\r\n\
             be delivered to one or more recipients.\r\n\
             \r\n\
             <gone@example.com>: host mx.example.com said: 550 5.1.1\r\n\
             user unknown\r\n";
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!(1, report.recipients.len());
        assert_eq!("gone@example.com", report.recipients[0].email.as_ref());
        assert_eq!("5.1.1", report.recipients[0].status_code);
        assert_eq!(BounceKind::Hard, report.recipients[0].kind);
        assert_eq!("Mail delivery failed", report.original_subject);
    }

    #[test]
    fn missing_status_falls_back_to_diagnostic_code() {
        let raw = "From: MAILER-DAEMON@mail.example.com\r\n\
             Subject: failure notice\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Final-Recipient: rfc822; c@example.com\r\n\
             Action: failed\r\n\
             Diagnostic-Code: smtp; 554 5.7.1 rejected by policy\r\n";
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!("5.7.1", report.recipients[0].status_code);
    }

    #[test]
    fn message_without_recipients_fails_closed() {
        let raw = "From: someone@example.com\r\n\
             Subject: Out of office\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             I am on vacation until Monday.\r\n";

        assert_err!(parse_bounce_report(raw.as_bytes()));
    }

    #[test]
    fn garbage_input_fails_closed() {
        assert_err!(parse_bounce_report(b"\xff\xfe not a mail message"));
        // Either fails header parsing or yields no recipients
        assert_err!(parse_bounce_report(b"complete nonsense"));
    }

    #[test]
    fn angle_bracketed_final_recipient_is_accepted() {
        let raw = "Subject: bounce\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             Final-Recipient: rfc822; <d@example.com>\r\n\
             Action: failed\r\n\
             Status: 5.2.2\r\n";
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!("d@example.com", report.recipients[0].email.as_ref());
    }

    #[test]
    fn enhanced_status_extraction_handles_surrounding_text() {
        assert_eq!(
            Some("5.1.1".to_string()),
            extract_enhanced_status("smtp; 550 5.1.1 user unknown")
        );
        assert_eq!(None, extract_enhanced_status("no code here"));
    }

    #[test]
    fn kind_for_action_vocabulary() {
        assert_eq!(BounceKind::Hard, kind_for_action("failed"));
        assert_eq!(BounceKind::Hard, kind_for_action("Failed (permanent)"));
        assert_eq!(BounceKind::Hard, kind_for_action("hard"));
        assert_eq!(BounceKind::Soft, kind_for_action("delayed"));
        assert_eq!(BounceKind::Soft, kind_for_action("relayed"));
        assert_eq!(BounceKind::Soft, kind_for_action(""));
    }

    #[test]
    fn report_with_status_part_ignores_text_noise() {
        // The human-readable part mentions an address too; only the
        // structured part must be used
        let raw = delivery_status_report("failed", "5.1.1", "March News");
        let report = parse_bounce_report(raw.as_bytes()).unwrap();

        assert_eq!(1, report.recipients.len());
        assert_ok!(report.recipients[0].email.as_ref().parse::<EmailAddress>());
    }
}
