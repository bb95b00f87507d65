use chrono::{DateTime, Utc};

use regex::{Captures, Regex};

use url::Url;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Recipient;

/// Markers bounding the machine-removable unsubscribe section
pub const UNSUBSCRIBE_BLOCK_BEGIN: &str = "<!-- unsubscribe -->";
pub const UNSUBSCRIBE_BLOCK_END: &str = "<!-- /unsubscribe -->";

/// Literal phrase identifying the plain-text unsubscribe line
pub const UNSUBSCRIBE_TEXT_PHRASE: &str = "Unsubscribe from this newsletter:";

const TEXT_WIDTH: usize = 80;

/// A per-recipient copy of an issue body, ready to hand to the transport
#[derive(Debug, Clone)]
pub struct PersonalizedEmail {
    pub html_body: String,
    pub text_body: String,
    /// Set unless the recipient opted out of the unsubscribe link
    pub unsubscribe_url: Option<String>,
}

/// Produce the personalized HTML and plain-text bodies for one recipient.
///
/// The shared template is never touched; the recipient gets an independent
/// copy with merge tags substituted and the unsubscribe section either
/// injected (with a tokenized per-recipient link) or stripped.
pub fn personalize(
    template_html: &str,
    recipient: &Recipient,
    issue_url: &str,
    unsubscribe_base: &Url,
) -> Result<PersonalizedEmail> {
    let body = substitute_merge_tags(template_html, recipient, issue_url);
    // Normalize: drop any unsubscribe section the renderer may have left in,
    // so the tokenized one below is the only one
    let html_body = strip_unsubscribe_html(&body);
    let text_body = strip_unsubscribe_text(&plain_text_of(&html_body)?);

    if recipient.no_unsub_link {
        return Ok(PersonalizedEmail {
            html_body,
            text_body,
            unsubscribe_url: None,
        });
    }

    let url = unsubscribe_url(unsubscribe_base, recipient.user_id, recipient.first_access);
    let html_body = format!(
        "{html_body}\n{UNSUBSCRIBE_BLOCK_BEGIN}\n<hr/>\n<p><a href=\"{url}\">{UNSUBSCRIBE_TEXT_PHRASE} {url}</a></p>\n{UNSUBSCRIBE_BLOCK_END}\n"
    );
    let text_body = format!("{text_body}\n{UNSUBSCRIBE_TEXT_PHRASE} {url}\n");

    Ok(PersonalizedEmail {
        html_body,
        text_body,
        unsubscribe_url: Some(url),
    })
}

/// Substitute recognized merge tags; unknown tags are left verbatim.
///
/// Recognized: `first_name`, `last_name`, `full_name`, `issue_link` and its
/// alias `issue_url`.
pub fn substitute_merge_tags(body: &str, recipient: &Recipient, issue_url: &str) -> String {
    lazy_static::lazy_static! {
        static ref MERGE_TAG: Regex = Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").unwrap();
    }

    MERGE_TAG
        .replace_all(body, |caps: &Captures| match &caps[1] {
            "first_name" => recipient.first_name.clone(),
            "last_name" => recipient.last_name.clone(),
            "full_name" => recipient.full_name(),
            "issue_link" | "issue_url" => issue_url.to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// The tokenized unsubscribe link for one recipient
pub fn unsubscribe_url(base: &Url, user_id: Uuid, first_access: DateTime<Utc>) -> String {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("user", &user_id.to_string())
        .append_pair("secret", &unsubscribe_secret(user_id, first_access));
    url.to_string()
}

/// The unsubscribe secret is the digest of the user id joined to the user's
/// first-access time, so the link stays stable for the account's lifetime
/// without storing another token
pub fn unsubscribe_secret(user_id: Uuid, first_access: DateTime<Utc>) -> String {
    let input = format!("{}+{}", user_id, first_access.timestamp());
    format!("{:x}", md5::compute(input))
}

/// Remove the marked unsubscribe section from an HTML body
pub fn strip_unsubscribe_html(body: &str) -> String {
    lazy_static::lazy_static! {
        static ref UNSUBSCRIBE_BLOCK: Regex =
            Regex::new(r"(?s)<!-- unsubscribe -->.*?<!-- /unsubscribe -->\n?").unwrap();
    }

    UNSUBSCRIBE_BLOCK.replace_all(body, "").into_owned()
}

/// Remove every line carrying the literal unsubscribe phrase from a
/// plain-text body
pub fn strip_unsubscribe_text(body: &str) -> String {
    let mut stripped: String = body
        .lines()
        .filter(|line| !line.contains(UNSUBSCRIBE_TEXT_PHRASE))
        .collect::<Vec<_>>()
        .join("\n");
    if body.ends_with('\n') && !stripped.is_empty() {
        stripped.push('\n');
    }
    stripped
}

fn plain_text_of(html: &str) -> Result<String> {
    html2text::from_read(html.as_bytes(), TEXT_WIDTH)
        .map_err(|e| Error::ParsingError(format!("Failed to render plain-text body: {}", e)))
}
