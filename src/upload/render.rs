use std::fmt::Write as _;

use super::types::{ArticleRecord, ItemMetadata, RenderedItem};

pub fn render(article: &ArticleRecord) -> RenderedItem {
    RenderedItem { html: build_html(article), metadata: build_metadata(article) }
}

fn build_html(a: &ArticleRecord) -> String {
    let mut b = String::with_capacity(a.content.len() + 256);
    let _ = writeln!(b, "<h1>{}</h1>", escape_html(&a.title));
    if !a.excerpt.is_empty() {
        let _ = writeln!(b, "<p>{}</p>", escape_html(&a.excerpt));
    }
    b.push_str("<div>\n");
    b.push_str(&neutralize_scripts(&a.content));
    b.push_str("\n</div>\n");
    b.push_str("<h3>Metadata</h3>\n");
    // Link and dates go out verbatim, unlike title/excerpt.
    let _ = write!(b, r#"<p>Source Url: <a href="{}">{}</a></p>"#, a.link, a.link);
    let _ = write!(b, "<p>Published Date: {}</p>", a.publish_date);
    let _ = write!(b, "<p>Updated Date: {}</p>", a.updated_date);
    b
}

fn build_metadata(a: &ArticleRecord) -> ItemMetadata {
    ItemMetadata {
        creation_date: a.publish_date.clone(),
        source_url: a.link.clone(),
        title: a.title.clone(),
    }
}

/// Case-sensitive substring rewrite of `<script` and `</script>` only.
/// Everything else in `content` passes through untouched.
fn neutralize_scripts(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("<script") {
            out.push_str("&lt;script");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("</script>") {
            out.push_str("&lt;/script&gt;");
            rest = tail;
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() { out.push(c); }
            rest = chars.as_str();
        }
    }
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&#34;"),
            _ => out.push(c),
        }
    }
    out
}
