//! Source-attribution footer assembly. The segment order is fixed so the
//! footer renders identically across every destination.

use crate::model::SourceDisplay;

/// Link bases for the footer anchors, taken from configuration.
#[derive(Debug, Clone)]
pub struct FooterLinks {
    pub backup_base: String,
    pub detail_base: String,
}

/// Append the attribution block to a translated body: source anchor (display
/// name plus bias), backup anchor, invite anchor (only for channels without a
/// public username), detail anchor, then the per-destination footer.
pub fn format_post(
    text: &str,
    link: &str,
    source: &SourceDisplay,
    backup_id: i64,
    footer: Option<&str>,
    links: &FooterLinks,
) -> String {
    let mut formatted = format!("{}\n\nQuelle: <a href='{}'>{}", text, link, source.display_name);
    if let Some(bias) = &source.bias {
        formatted.push_str(&format!(" {}", bias));
    }
    formatted.push_str(&format!(
        "</a> |<a href='{}/{}'> 💾 </a>",
        links.backup_base, backup_id
    ));

    if source.username.is_none() {
        if let Some(invite) = &source.invite {
            formatted.push_str(&format!("|<a href='https://t.me/+{}'> 🔗️ </a>", invite));
        }
    }

    if let Some(detail_id) = source.detail_id {
        formatted.push_str(&format!(
            "|<a href='{}/{}'> ℹ️ </a>",
            links.detail_base, detail_id
        ));
    }

    if let Some(footer) = footer {
        formatted.push_str(footer);
    }

    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links() -> FooterLinks {
        FooterLinks {
            backup_base: "https://t.me/nn_backup".into(),
            detail_base: "https://t.me/nn_sources".into(),
        }
    }

    fn source() -> SourceDisplay {
        SourceDisplay {
            display_name: "Frontline News".into(),
            is_spread: true,
            bias: Some("🟡".into()),
            invite: None,
            username: Some("frontline".into()),
            detail_id: Some(42),
            destination: Some(-2001),
        }
    }

    #[test]
    fn full_footer_order() {
        let out = format_post(
            "body",
            "https://t.me/frontline/7",
            &source(),
            9000,
            Some("\n\n👉 Folge @NYX_News für mehr!"),
            &links(),
        );
        assert_eq!(
            out,
            "body\n\nQuelle: <a href='https://t.me/frontline/7'>Frontline News 🟡</a> \
             |<a href='https://t.me/nn_backup/9000'> 💾 </a>\
             |<a href='https://t.me/nn_sources/42'> ℹ️ </a>\
             \n\n👉 Folge @NYX_News für mehr!"
        );
    }

    #[test]
    fn invite_anchor_only_without_public_username() {
        let mut src = source();
        src.username = None;
        src.invite = Some("AbCdEf".into());
        let out = format_post("body", "link", &src, 1, None, &links());
        assert!(out.contains("<a href='https://t.me/+AbCdEf'> 🔗️ </a>"));

        // A public username suppresses the invite anchor.
        let mut src = source();
        src.invite = Some("AbCdEf".into());
        let out = format_post("body", "link", &src, 1, None, &links());
        assert!(!out.contains("t.me/+AbCdEf"));
    }

    #[test]
    fn optional_segments_absent() {
        let src = SourceDisplay {
            display_name: "Plain".into(),
            is_spread: true,
            bias: None,
            invite: None,
            username: None,
            detail_id: None,
            destination: None,
        };
        let out = format_post("body", "link", &src, 5, None, &links());
        assert_eq!(
            out,
            "body\n\nQuelle: <a href='link'>Plain</a> |<a href='https://t.me/nn_backup/5'> 💾 </a>"
        );
    }
}
