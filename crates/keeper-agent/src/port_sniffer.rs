//! Infers a listening port from free-form process output.
//!
//! Pattern classes are tried in a fixed order and the first class that yields a
//! valid port wins. Framework startup banners come first because the generic
//! verb patterns happily match unrelated numbers.

use std::sync::LazyLock;

use regex::Regex;

static NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:error|errno|failed|failure|refused|timeout|timed out|cannot|can't|unable|already in use|bind|connecting to)\b",
    )
    .expect("negative pattern")
});

/// One regex per known startup banner; capture group 1 is the port.
static FRAMEWORK: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        // uvicorn / FastAPI
        r"(?i)uvicorn running on https?://[^\s/]+:(\d{1,5})\b",
        // fastapi CLI
        r"(?i)serving at:\s*https?://[^\s/]+:(\d{1,5})\b",
        // gradio
        r"(?i)running on local url:\s*https?://[^\s/]+:(\d{1,5})\b",
        // streamlit
        r"(?i)(?:local|network|external) url:\s*https?://[^\s/]+:(\d{1,5})\b",
        // gunicorn
        r"(?i)listening at:\s*https?://[^\s/]+:(\d{1,5})\b",
        // django runserver
        r"(?i)starting development server at https?://[^\s/]+:(\d{1,5})\b",
        // dash
        r"(?i)dash is running on https?://[^\s/]+:(\d{1,5})\b",
        // flask / werkzeug / hypercorn
        r"(?i)\*?\s*running on https?://[^\s/]+:(\d{1,5})\b",
        // jupyter
        r"(?i)jupyter server .*? is running at:?\s*https?://[^\s/]+:(\d{1,5})\b",
    ])
});

static GENERIC: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(?:listening|running|started|serving)\b(?:\s+[\w\-]+){0,3}?\s+(?:on|at)\b:?\s*(?:port\s*:?\s*)?(?:(?:https?://)?(?:[\w.\-]*|\[[0-9a-f:]*\]):)?(\d{1,5})\b",
        r"(?i)\b(?:listening|running|started|serving)\b(?:\s+[\w\-]+){0,3}?\s+port\s*:?\s*(\d{1,5})\b",
    ])
});

static URL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{1,5})\b",
        r"(?i)\b(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{1,5})\b",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("port pattern"))
        .collect()
}

fn first_valid_port(patterns: &[Regex], line: &str) -> Option<u16> {
    for re in patterns {
        for caps in re.captures_iter(line) {
            let Some(m) = caps.get(1) else {
                continue;
            };
            // Out-of-range candidates keep the search going.
            if let Ok(port) = m.as_str().parse::<u32>()
                && (1..=65535).contains(&port)
            {
                return Some(port as u16);
            }
        }
    }
    None
}

/// Returns the port `line` announces the app is listening on, if any.
pub fn sniff(line: &str) -> Option<u16> {
    if NEGATIVE.is_match(line) {
        return None;
    }
    [&*FRAMEWORK, &*GENERIC, &*URL]
        .into_iter()
        .find_map(|class| first_valid_port(class, line))
}
