use axum::http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct RootQuery {
    pub q: Option<String>,
}

/// What the client asked, and the conversation it carried with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct ChatInput {
    pub query: String,
    pub history: String,
}

impl ChatInput {
    /// Read the query and history from a form-encoded POST body, falling back to the URL
    /// query. Any other body is the raw query, cut to `body_limit` bytes.
    pub fn from_post(
        headers: &HeaderMap,
        url_query: Option<String>,
        body: &[u8],
        body_limit: usize,
    ) -> Self {
        let is_form = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

        let mut input = ChatInput::default();
        if is_form {
            for (key, value) in url::form_urlencoded::parse(body) {
                match key.as_ref() {
                    "q" if input.query.is_empty() => input.query = value.into_owned(),
                    "h" if input.history.is_empty() => input.history = value.into_owned(),
                    _ => {}
                }
            }
        }
        if input.query.is_empty() {
            input.query = url_query.unwrap_or_default();
        }
        if input.query.is_empty() && !is_form {
            let body = &body[..body.len().min(body_limit)];
            input.query = String::from_utf8_lossy(body).into_owned();
        }
        input
    }

    /// The prompt sent to the generator: the history followed by the new question.
    pub fn prompt(&self) -> Cow<'_, str> {
        if self.history.is_empty() {
            Cow::Borrowed(&self.query)
        } else {
            Cow::Owned(format!("{}Q: {}", self.history, self.query))
        }
    }

    /// The conversation including the new exchange, kept within `limit` bytes.
    pub fn with_answer(&self, answer: &str, limit: usize) -> String {
        let content = format!("{}Q: {}\nA: {}\n\n", self.history, self.query, answer);
        tail_utf8(&content, limit).to_string()
    }
}

/// The last `limit` bytes of `s`, moved forward to the next character boundary.
pub(super) fn tail_utf8(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub(super) struct AnswerResult {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Format {
    EventStream,
    Json,
    Html,
    Text,
}

impl Format {
    /// Pick a response format from the request headers. Streams are only offered when
    /// there's a question to answer.
    pub fn negotiate(headers: &HeaderMap, has_query: bool) -> Self {
        let header = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        };
        let accept = header(ACCEPT);
        let is_curl = header(USER_AGENT).starts_with("curl/");
        if accept.contains("text/event-stream") && has_query {
            Format::EventStream
        } else if accept.contains("application/json") {
            Format::Json
        } else if accept.contains("text/html") && !is_curl {
            Format::Html
        } else {
            Format::Text
        }
    }
}

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>ch.at</title>
    <style>
        body { text-align: center; margin: 40px; }
        pre { text-align: left; max-width: 600px; margin: 20px auto; padding: 20px;
              white-space: pre-wrap; word-wrap: break-word; }
        input[type="text"] { width: 300px; }
    </style>
</head>
<body>
    <h1>ch.at</h1>
    <p><i>pronounced "ch-dot-at"</i></p>
"#;

const PAGE_TAIL: &str = r#"    <p><a href="/">Clear History</a></p>
</body>
</html>"#;

/// Render the chat page around the conversation so far.
pub(super) fn render_page(content: &str) -> String {
    let content = escape_html(content);
    format!(
        r#"{PAGE_HEAD}    <pre>{content}</pre>
    <form method="POST" action="/">
        <input type="text" name="q" placeholder="Type your message..." autofocus>
        <textarea name="h" style="display:none">{content}</textarea>
        <input type="submit" value="Send">
    </form>
{PAGE_TAIL}"#
    )
}

fn escape_html(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}
