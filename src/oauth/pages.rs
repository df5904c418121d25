//! HTML pages shown to the browser at the end of the OAuth flow

const STYLE: &str = r"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            color: white;
        }
        .container {
            text-align: center;
            padding: 2rem;
            background: rgba(255,255,255,0.1);
            border-radius: 16px;
            max-width: 480px;
        }
        .icon { font-size: 4rem; margin-bottom: 1rem; }
        h1 { margin: 0 0 0.5rem 0; }
        p { margin: 0; opacity: 0.9; }
        pre { white-space: pre-wrap; margin-top: 1rem; opacity: 0.7; }
";

fn page(title: &str, background: &str, icon: &str, body: &str, script: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>{STYLE}        body {{ background: {background}; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="icon">{icon}</div>
        <h1>{title}</h1>
        {body}
    </div>{script}
</body>
</html>"#
    )
}

/// Shown once the token has been handed to the waiting client
pub fn success_page() -> String {
    page(
        "Success!",
        "#2e7d32",
        "✓",
        "<p>You can close this tab.</p>",
        "\n    <script>window.close()</script>",
    )
}

/// Shown when the flow failed; `error` is escaped
pub fn error_page(error: &str) -> String {
    page(
        "Error",
        "#c0392b",
        "✗",
        &format!(
            "<p>There was an error. Please try again.</p>\n        <pre>{}</pre>",
            html_escape(error)
        ),
        "",
    )
}

/// Shown when no client is waiting for this authorization any more
pub fn expired_page() -> String {
    page(
        "Nothing to do",
        "#546e7a",
        "…",
        "<p>This sign-in request is no longer pending. Start again from the command line if you still need to authenticate.</p>",
        "",
    )
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_page_escapes_message() {
        let html = error_page("<script>alert('x')</script>");
        assert!(html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn success_page_closes_tab() {
        let html = success_page();
        assert!(html.contains("Success!"));
        assert!(html.contains("window.close()"));
    }
}
