//! Small shared HTML scanning helpers.

use std::sync::LazyLock;

use regex::Regex;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static IMG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img[^>]*>").expect("valid regex"));
static SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)src\s*=\s*["']([^"']+)["']"#).expect("valid regex"));
static ALT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)alt\s*=\s*["']([^"']*)["']"#).expect("valid regex"));

/// Strip tags, decode the common entities, collapse whitespace.
pub fn strip_tags(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    WS_RE.replace_all(&text, " ").trim().to_string()
}

/// An `<img>` tag's src and alt, when present.
#[derive(Debug, Clone, Default)]
pub struct ImgTag {
    pub src: Option<String>,
    pub alt: Option<String>,
}

impl ImgTag {
    /// Lowercased final path segment of src, query stripped.
    pub fn file_name(&self) -> Option<String> {
        let src = self.src.as_deref()?;
        let path = src.split(['?', '#']).next().unwrap_or(src);
        path.rsplit('/').next().map(|f| f.to_lowercase())
    }
}

pub fn images(html: &str) -> Vec<ImgTag> {
    IMG_RE
        .find_iter(html)
        .map(|m| {
            let tag = m.as_str();
            ImgTag {
                src: SRC_RE.captures(tag).map(|c| c[1].to_string()),
                alt: ALT_RE.captures(tag).map(|c| c[1].to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_entities() {
        let html = "<td><b>Caer&nbsp;Benowyc</b> &amp; more</td>";
        assert_eq!(strip_tags(html), "Caer Benowyc & more");
    }

    #[test]
    fn extracts_img_attrs() {
        let html = r#"<img alt="emblem" src="/img/emblem_12.png?v=3">"#;
        let imgs = images(html);
        assert_eq!(imgs.len(), 1);
        assert_eq!(imgs[0].alt.as_deref(), Some("emblem"));
        assert_eq!(imgs[0].file_name().as_deref(), Some("emblem_12.png"));
    }
}
