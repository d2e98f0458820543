//! Naive HTML element lookup for price selectors.
//!
//! Understands the selector shapes that show up in the selector table:
//! `tag`, `#id`, `.class`, `[attr]`, `[attr=value]` and any compound of them
//! (`span.price.now`, `meta[itemprop=price]`), joined by whitespace as a
//! descendant combinator (`> ` is treated the same way). Pseudo-classes and
//! sibling combinators are rejected. Works on the raw markup string; there is
//! no DOM.

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// Tags whose boundaries become line breaks in extracted text.
const BLOCK_TAGS: &[&str] = &[
    "br", "div", "p", "li", "tr", "td", "th", "dd", "dt", "h1", "h2", "h3", "h4", "h5", "h6",
    "section", "article", "ul", "ol", "table",
];

/// One compound selector, e.g. `span.price[data-role=now]`.
#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    /// Byte offset just past the opening tag's `>`.
    open_end: usize,
    self_closing: bool,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn is_void(&self) -> bool {
        self.self_closing || VOID_TAGS.contains(&self.name.as_str())
    }
}

impl Compound {
    fn matches(&self, el: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if *tag != el.name {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if el.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let class_attr = el.attr("class").unwrap_or("");
            if !self
                .classes
                .iter()
                .all(|c| class_attr.split_whitespace().any(|have| have == c))
            {
                return false;
            }
        }
        self.attrs.iter().all(|(name, want)| match (el.attr(name), want) {
            (Some(_), None) => true,
            (Some(have), Some(want)) => have == want,
            (None, _) => false,
        })
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Split a selector into compounds, keeping bracketed attribute values intact.
fn split_compounds(selector: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    for c in selector.chars() {
        match c {
            '[' => {
                in_brackets = true;
                current.push(c);
            }
            ']' => {
                in_brackets = false;
                current.push(c);
            }
            c if !in_brackets && (c.is_whitespace() || c == '>') => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_compound(raw: &str) -> Option<Compound> {
    let mut out = Compound::default();
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;

    let read_ident = |i: &mut usize| -> String {
        let start = *i;
        while *i < chars.len() && is_ident_char(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    if i < chars.len() && chars[i] == '*' {
        i += 1;
    } else if i < chars.len() && is_ident_char(chars[i]) {
        out.tag = Some(read_ident(&mut i).to_ascii_lowercase());
    }

    while i < chars.len() {
        match chars[i] {
            '#' => {
                i += 1;
                let id = read_ident(&mut i);
                if id.is_empty() {
                    return None;
                }
                out.id = Some(id);
            }
            '.' => {
                i += 1;
                let class = read_ident(&mut i);
                if class.is_empty() {
                    return None;
                }
                out.classes.push(class);
            }
            '[' => {
                let close = chars[i..].iter().position(|c| *c == ']')? + i;
                let inner: String = chars[i + 1..close].iter().collect();
                i = close + 1;
                match inner.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                        out.attrs
                            .push((name.trim().to_ascii_lowercase(), Some(value.to_string())));
                    }
                    None => out.attrs.push((inner.trim().to_ascii_lowercase(), None)),
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

fn parse_selector(selector: &str) -> Option<Vec<Compound>> {
    let chain: Option<Vec<Compound>> = split_compounds(selector)
        .iter()
        .map(|p| parse_compound(p))
        .collect();
    chain.filter(|c| !c.is_empty())
}

/// Parse `name="v"`, `name='v'`, `name=v` and bare `name` up to the tag's `>`.
/// Returns the attributes, the offset of `>` and whether the tag self-closes.
fn parse_attributes(html: &str, start: usize, end: usize) -> Option<(Vec<(String, String)>, usize, bool)> {
    let bytes = html.as_bytes();
    let mut attrs = Vec::new();
    let mut i = start;
    loop {
        while i < end && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= end {
            return None;
        }
        match bytes[i] {
            b'>' => return Some((attrs, i, false)),
            b'/' => {
                if i + 1 < end && bytes[i + 1] == b'>' {
                    return Some((attrs, i + 1, true));
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let name_start = i;
        while i < end && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'>' | b'/') {
            i += 1;
        }
        let name = html[name_start..i].to_ascii_lowercase();
        while i < end && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if i < end && bytes[i] == b'=' {
            i += 1;
            while i < end && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < end && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                let value_start = i + 1;
                let value_end = value_start + bytes[value_start..end].iter().position(|b| *b == quote)?;
                value = html[value_start..value_end].to_string();
                i = value_end + 1;
            } else {
                let value_start = i;
                while i < end && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                value = html[value_start..i].to_string();
            }
        } else if name.is_empty() {
            i += 1;
        }

        if !name.is_empty() {
            attrs.push((name, decode_entities(&value)));
        }
    }
}

/// Next opening tag in `lc[from..end]`, skipping comments, closing tags and
/// declarations.
fn next_element(html: &str, lc: &str, from: usize, end: usize) -> Option<Element> {
    let mut pos = from;
    while pos < end {
        let lt = pos + lc[pos..end].find('<')?;
        let rest = &lc[lt..end];
        if rest.starts_with("<!--") {
            pos = lt + 4 + rest[4..].find("-->")? + 3;
            continue;
        }
        if rest.starts_with("</") || rest.starts_with("<!") || rest.starts_with("<?") {
            pos = lt + 1;
            continue;
        }
        let name_len = rest[1..]
            .find(|c: char| !(is_ident_char(c) || c == ':'))
            .unwrap_or(rest.len() - 1);
        if name_len == 0 {
            pos = lt + 1;
            continue;
        }
        let name = rest[1..1 + name_len].to_string();
        let (attrs, gt, self_closing) = parse_attributes(html, lt + 1 + name_len, end)?;
        return Some(Element {
            name,
            attrs,
            open_end: gt + 1,
            self_closing,
        });
    }
    None
}

fn tag_boundary(rest: &str, at: usize) -> bool {
    match rest.as_bytes().get(at) {
        None => true,
        Some(b) => b.is_ascii_whitespace() || *b == b'>' || *b == b'/',
    }
}

/// Offset of the `<` that closes the element named `name`, honouring nesting.
fn find_close(lc: &str, name: &str, from: usize, end: usize) -> Option<usize> {
    let open = format!("<{name}");
    let close = format!("</{name}");
    let mut depth = 1usize;
    let mut pos = from;
    while pos < end {
        let lt = pos + lc[pos..end].find('<')?;
        let rest = &lc[lt..end];
        if rest.starts_with(&close) && tag_boundary(rest, close.len()) {
            depth -= 1;
            if depth == 0 {
                return Some(lt);
            }
        } else if rest.starts_with(&open) && tag_boundary(rest, open.len()) {
            let gt = rest.find('>')?;
            if !rest[..gt].ends_with('/') {
                depth += 1;
            }
        }
        pos = lt + 1;
    }
    None
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Visible text of an element's inner markup. Block-level tag boundaries
/// become newlines, inline tags vanish.
fn element_text(inner: &str) -> String {
    let mut out = String::new();
    let mut rest = inner;
    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let Some(gt) = rest[lt..].find('>').map(|g| lt + g) else {
            rest = "";
            break;
        };
        let name: String = rest[lt + 1..gt]
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        }
        rest = &rest[gt + 1..];
    }
    out.push_str(rest);
    decode_entities(&out)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn find_in(html: &str, lc: &str, start: usize, end: usize, chain: &[Compound]) -> Option<String> {
    let (first, rest) = chain.split_first()?;
    let mut pos = start;
    while let Some(el) = next_element(html, lc, pos, end) {
        pos = el.open_end;
        if !first.matches(&el) {
            continue;
        }
        let inner_end = if el.is_void() {
            None
        } else {
            find_close(lc, &el.name, el.open_end, end)
        };

        if rest.is_empty() {
            let text = inner_end
                .map(|ie| element_text(&html[el.open_end..ie]))
                .unwrap_or_default();
            if !text.is_empty() {
                return Some(text);
            }
            // <meta itemprop="price" content="..."> and friends.
            if let Some(v) = el.attr("content").or_else(|| el.attr("value")) {
                return Some(v.trim().to_string());
            }
            continue;
        }

        if let Some(ie) = inner_end {
            if let Some(found) = find_in(html, lc, el.open_end, ie, rest) {
                return Some(found);
            }
        }
    }
    None
}

/// Text of the first element matching `selector`, or `None` when nothing
/// matches or the selector uses unsupported syntax.
pub fn select_text(html: &str, selector: &str) -> Option<String> {
    let chain = parse_selector(selector)?;
    let lc = html.to_ascii_lowercase();
    find_in(html, &lc, 0, html.len(), &chain)
}

/// True if `selector` only uses syntax [`select_text`] understands.
pub fn is_supported_selector(selector: &str) -> bool {
    parse_selector(selector).is_some()
}
