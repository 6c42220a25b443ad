use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

/// Elements whose text never belongs to an article body.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "iframe", "noscript", "form",
];

const CONTAINER_SELECTORS: &[&str] = &[
    "article",
    "main",
    ".post-content",
    ".article-content",
    ".entry-content",
    "#content",
    ".content",
    ".post",
    ".article",
    ".story-body",
    ".story",
    ".post-body",
    ".news-article",
    ".blog-post",
    ".node-content",
    "[itemprop=\"articleBody\"]",
    ".body",
    ".entry",
    ".story-text",
];

const MIN_PARAGRAPH_CHARS: usize = 20;
const MIN_DENSE_BLOCK_WORDS: usize = 50;

lazy_static! {
    static ref CONTAINERS: Vec<Selector> = CONTAINER_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect();
    static ref PARAGRAPH: Selector = selector("p");
    static ref DIV: Selector = selector("div");
    static ref BODY: Selector = selector("body");
    static ref OG_TITLE: Selector = selector("meta[property=\"og:title\"]");
    static ref TITLE: Selector = selector("title");
    static ref H1: Selector = selector("h1");
    static ref NOISE: Regex = Regex::new(
        r"(?i)share this article|share on:|related articles|you might also like|click to share|comments \(\d+\)|read more|subscribe to our newsletter|sign up for our newsletter|advertisement"
    )
    .unwrap();
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

/// One way of locating the article body in a parsed page.
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw candidate text, or `None` when the strategy finds nothing.
    fn extract(&self, document: &Html) -> Option<String>;
}

/// The order the extractor tries strategies in.
pub fn default_chain() -> Vec<Box<dyn ExtractionStrategy>> {
    vec![
        Box::new(ContainerStrategy),
        Box::new(ParagraphStrategy),
        Box::new(DensityStrategy),
        Box::new(BodyStrategy),
    ]
}

fn is_skipped(element: ElementRef<'_>) -> bool {
    SKIPPED_TAGS.contains(&element.value().name())
}

fn inside_skipped(element: ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(is_skipped)
}

/// Text of `element` and its descendants, skipping boilerplate subtrees,
/// with text nodes joined by `separator`.
pub(crate) fn visible_text(element: ElementRef<'_>, separator: &str) -> String {
    let mut parts = Vec::new();
    collect_text(element, &mut parts);
    parts.join(separator)
}

fn collect_text<'a>(element: ElementRef<'a>, parts: &mut Vec<&'a str>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let text: &'a str = text;
                if !text.trim().is_empty() {
                    parts.push(text);
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    if !is_skipped(child) {
                        collect_text(child, parts);
                    }
                }
            }
            _ => {}
        }
    }
}

fn non_blank(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// First known article container on the page.
pub struct ContainerStrategy;

impl ExtractionStrategy for ContainerStrategy {
    fn name(&self) -> &'static str {
        "container"
    }

    fn extract(&self, document: &Html) -> Option<String> {
        CONTAINERS.iter().find_map(|selector| {
            document
                .select(selector)
                .filter(|el| !inside_skipped(*el))
                .find_map(|el| non_blank(visible_text(el, "\n")))
        })
    }
}

/// Every substantial paragraph, in document order.
pub struct ParagraphStrategy;

impl ExtractionStrategy for ParagraphStrategy {
    fn name(&self) -> &'static str {
        "paragraphs"
    }

    fn extract(&self, document: &Html) -> Option<String> {
        let paragraphs: Vec<String> = document
            .select(&PARAGRAPH)
            .filter(|p| !inside_skipped(*p))
            .map(|p| visible_text(p, "").trim().to_string())
            .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
            .collect();
        non_blank(paragraphs.join("\n\n"))
    }
}

/// The `div` with the best text-to-markup ratio, weighted by its text length.
pub struct DensityStrategy;

impl ExtractionStrategy for DensityStrategy {
    fn name(&self) -> &'static str {
        "density"
    }

    fn extract(&self, document: &Html) -> Option<String> {
        let mut best: Option<(f64, ElementRef<'_>)> = None;
        for div in document.select(&DIV).filter(|d| !inside_skipped(*d)) {
            let text = visible_text(div, " ");
            if text.split_whitespace().count() <= MIN_DENSE_BLOCK_WORDS {
                continue;
            }
            let markup_len = div.html().len().max(1) as f64;
            let text_len = text.len() as f64;
            let score = text_len * (text_len / markup_len);
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, div));
            }
        }
        best.and_then(|(_, div)| non_blank(visible_text(div, "\n")))
    }
}

/// Whatever visible text the body holds.
pub struct BodyStrategy;

impl ExtractionStrategy for BodyStrategy {
    fn name(&self) -> &'static str {
        "body"
    }

    fn extract(&self, document: &Html) -> Option<String> {
        document
            .select(&BODY)
            .next()
            .and_then(|body| non_blank(visible_text(body, "\n")))
    }
}

/// Best available page title: `og:title`, then `<title>`, then the first `<h1>`.
pub fn page_title(document: &Html) -> Option<String> {
    let og = document
        .select(&OG_TITLE)
        .filter_map(|m| m.value().attr("content"))
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty());
    og.or_else(|| {
        [&*TITLE, &*H1].into_iter().find_map(|sel| {
            document
                .select(sel)
                .map(|el| el.text().collect::<Vec<_>>().join(" "))
                .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
                .find(|t| !t.is_empty())
        })
    })
}

/// Whole-page visible text with one text node per line.
pub fn page_text(document: &Html) -> String {
    document
        .select(&BODY)
        .next()
        .map(|body| visible_text(body, "\n"))
        .unwrap_or_default()
}

/// Strips sharing and newsletter boilerplate, then trims every line and drops
/// the blank ones.
pub fn clean_text(text: &str) -> String {
    NOISE
        .replace_all(text, "")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(n: usize) -> String {
        vec!["ransomware"; n].join(" ")
    }

    #[test]
    fn test_container_skips_navigation_and_scripts() {
        let html = r#"<html><body>
            <article>
              <nav>Home | News</nav>
              <h2>Loader update</h2>
              <p>The loader now uses <b>signed</b> drivers.</p>
              <script>var tracking = 1;</script>
            </article>
        </body></html>"#;
        let doc = Html::parse_document(html);
        let text = ContainerStrategy.extract(&doc).unwrap();
        assert!(text.contains("Loader update"));
        assert!(text.contains("signed"));
        assert!(!text.contains("Home | News"));
        assert!(!text.contains("tracking"));
    }

    #[test]
    fn test_container_order_prefers_article_over_content_class() {
        let html = r#"<html><body>
            <div class="content">Sidebar teaser text</div>
            <article>Real story body</article>
        </body></html>"#;
        let doc = Html::parse_document(html);
        assert_eq!(ContainerStrategy.extract(&doc).unwrap().trim(), "Real story body");
    }

    #[test]
    fn test_paragraphs_drop_short_fragments() {
        let html = r#"<html><body>
            <p>Too short.</p>
            <p>The actor deployed a <i>custom</i> backdoor on edge devices.</p>
            <footer><p>Copyright notice for the whole site here.</p></footer>
            <p>Patches were released for all affected versions today.</p>
        </body></html>"#;
        let doc = Html::parse_document(html);
        let text = ParagraphStrategy.extract(&doc).unwrap();
        assert_eq!(
            text,
            "The actor deployed a custom backdoor on edge devices.\n\nPatches were released for all affected versions today."
        );
    }

    #[test]
    fn test_density_prefers_text_heavy_block() {
        let html = format!(
            r#"<html><body>
            <div id="links"><a href="/a">{}</a><a href="/b">x</a></div>
            <div id="story"><span>{}</span></div>
            <div id="tiny">few words</div>
            </body></html>"#,
            sentence(55),
            sentence(120)
        );
        let doc = Html::parse_document(&html);
        let text = DensityStrategy.extract(&doc).unwrap();
        assert_eq!(text.split_whitespace().count(), 120);
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        let doc = Html::parse_document("<html><body><script>x()</script></body></html>");
        for strategy in default_chain() {
            assert!(strategy.extract(&doc).is_none(), "{} found text", strategy.name());
        }
    }

    #[test]
    fn test_title_sources_in_order() {
        let doc = Html::parse_document(
            r#"<html><head><meta property="og:title" content=" OG Title "><title>Tab</title></head><body><h1>Head</h1></body></html>"#,
        );
        assert_eq!(page_title(&doc).as_deref(), Some("OG Title"));

        let doc = Html::parse_document("<html><head><title>Tab  Title</title></head><body><h1>Head</h1></body></html>");
        assert_eq!(page_title(&doc).as_deref(), Some("Tab Title"));

        let doc = Html::parse_document("<html><body><h1>Only <em>heading</em></h1></body></html>");
        assert_eq!(page_title(&doc).as_deref(), Some("Only heading"));

        let doc = Html::parse_document("<html><body><p>nothing</p></body></html>");
        assert_eq!(page_title(&doc), None);
    }

    #[test]
    fn test_clean_text() {
        let raw = "  First line  \n\n\n   \nShare this article\nSecond   line\nREAD MORE\n Advertisement \nComments (12)\n";
        assert_eq!(clean_text(raw), "First line\nSecond   line");
    }
}
