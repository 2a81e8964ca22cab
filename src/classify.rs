use crate::resolver::ActionIntent;
use regex::Regex;
use std::env;
use std::fmt;
use std::sync::LazyLock;

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("url pattern"));
static BARE_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:go to|navigate to|navigate|open|visit)\s+((?:[a-z0-9-]+\.)+[a-z]{2,}(?:/\S*)?)")
        .expect("domain pattern")
});
static TYPE_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btype\s+(.+)").expect("type pattern"));
static SEARCH_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bsearch(?:\s+for)?\s+(.+)").expect("search pattern"));

const DESTINATION_PHRASES: &[&str] = &["go to", "navigate", "open", "visit"];
const LOGIN_PHRASES: &[&str] = &["login", "log in", "sign in"];

/// Credentials and entry point for the scripted login flow.
#[derive(Clone)]
pub struct LoginProfile {
    pub url: String,
    pub email: String,
    pub password: String,
}

impl LoginProfile {
    /// `LOGIN_URL`, `LOGIN_EMAIL` and `LOGIN_PASSWORD` must all be set.
    pub fn from_env() -> Option<Self> {
        let url = env::var("LOGIN_URL").ok().filter(|s| !s.trim().is_empty())?;
        let email = env::var("LOGIN_EMAIL").ok().filter(|s| !s.is_empty())?;
        let password = env::var("LOGIN_PASSWORD").ok().filter(|s| !s.is_empty())?;
        Some(Self { url, email, password })
    }
}

impl fmt::Debug for LoginProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginProfile")
            .field("url", &self.url)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum TaskPlan {
    Act(ActionIntent),
    Login(LoginProfile),
    /// Open `url` and submit `term` through the site's search box.
    Search { url: String, term: String },
    /// Nothing to do on the page; report the analysis.
    Describe,
}

/// Maps task text (and, when available, the model's analysis) to a plan.
pub trait TaskClassifier: Send + Sync {
    fn classify(&self, task: &str, analysis: Option<&str>) -> TaskPlan;
}

/// Keyword precedence: login (if configured), destination with a search
/// term, destination, click, type, screenshot, then describe.
#[derive(Clone, Debug)]
pub struct KeywordClassifier {
    aliases: Vec<(String, String)>,
    login: Option<LoginProfile>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            aliases: vec![
                ("youtube".into(), "https://youtube.com".into()),
                ("google".into(), "https://google.com".into()),
            ],
            login: None,
        }
    }
}

impl KeywordClassifier {
    pub fn with_login(mut self, profile: Option<LoginProfile>) -> Self {
        self.login = profile;
        self
    }

    pub fn with_alias(mut self, word: impl Into<String>, url: impl Into<String>) -> Self {
        self.aliases.push((word.into().to_lowercase(), url.into()));
        self
    }

    /// Literal URL anywhere in the task, or a destination phrase naming a
    /// known alias or a bare domain.
    pub fn destination(&self, task: &str) -> Option<String> {
        if let Some(m) = URL.find(task) {
            let url = m.as_str().trim_end_matches(['.', ',', ')', ';', '!', '?', '"', '\'']);
            return Some(url.to_string());
        }
        let lower = task.to_lowercase();
        if !DESTINATION_PHRASES.iter().any(|p| lower.contains(p)) {
            return None;
        }
        if let Some((_, url)) = self.aliases.iter().find(|(word, _)| lower.contains(word.as_str())) {
            return Some(url.clone());
        }
        BARE_DOMAIN
            .captures(task)
            .and_then(|c| c.get(1))
            .map(|m| format!("https://{}", m.as_str().trim_end_matches(['.', ','])))
    }

    fn text_to_type(task: &str) -> Option<String> {
        unquote(TYPE_TEXT.captures(task)?.get(1)?.as_str())
    }

    fn search_term(task: &str) -> Option<String> {
        let raw = SEARCH_TERM.captures(task)?.get(1)?.as_str();
        unquote(raw.trim_end_matches(['.', '!', '?']))
    }
}

impl TaskClassifier for KeywordClassifier {
    fn classify(&self, task: &str, _analysis: Option<&str>) -> TaskPlan {
        let lower = task.to_lowercase();
        if let Some(profile) = &self.login {
            if LOGIN_PHRASES.iter().any(|p| lower.contains(p)) {
                return TaskPlan::Login(profile.clone());
            }
        }
        if let Some(url) = self.destination(task) {
            if let Some(term) = Self::search_term(task) {
                return TaskPlan::Search { url, term };
            }
            return TaskPlan::Act(ActionIntent::Navigate(url));
        }
        if lower.contains("click") {
            return TaskPlan::Act(ActionIntent::Click);
        }
        if let Some(text) = Self::text_to_type(task) {
            return TaskPlan::Act(ActionIntent::TypeText(text));
        }
        if lower.contains("screenshot") {
            return TaskPlan::Act(ActionIntent::Screenshot);
        }
        TaskPlan::Describe
    }
}

fn unquote(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(task: &str) -> Option<ActionIntent> {
        match KeywordClassifier::default().classify(task, None) {
            TaskPlan::Act(i) => Some(i),
            _ => None,
        }
    }

    #[test]
    fn literal_url_becomes_navigate() {
        assert_eq!(
            intent("go to https://example.org"),
            Some(ActionIntent::Navigate("https://example.org".into()))
        );
        assert_eq!(
            intent("please open https://example.org/docs."),
            Some(ActionIntent::Navigate("https://example.org/docs".into()))
        );
    }

    #[test]
    fn aliases_and_bare_domains_resolve() {
        assert_eq!(intent("Go to Google"), Some(ActionIntent::Navigate("https://google.com".into())));
        assert_eq!(intent("navigate to YouTube"), Some(ActionIntent::Navigate("https://youtube.com".into())));
        assert_eq!(intent("visit rust-lang.org"), Some(ActionIntent::Navigate("https://rust-lang.org".into())));
        let custom = KeywordClassifier::default().with_alias("Docs", "https://docs.rs");
        assert!(matches!(
            custom.classify("open docs", None),
            TaskPlan::Act(ActionIntent::Navigate(u)) if u == "https://docs.rs"
        ));
    }

    #[test]
    fn destination_outranks_click() {
        assert_eq!(
            intent("click through to https://example.org"),
            Some(ActionIntent::Navigate("https://example.org".into()))
        );
    }

    #[test]
    fn unresolvable_destination_falls_through() {
        assert!(matches!(
            KeywordClassifier::default().classify("navigate somewhere nice", None),
            TaskPlan::Describe
        ));
        assert_eq!(intent("navigate and click the button"), Some(ActionIntent::Click));
    }

    #[test]
    fn destination_with_search_term_becomes_search() {
        match KeywordClassifier::default().classify("go to google and search for rust async", None) {
            TaskPlan::Search { url, term } => {
                assert_eq!(url, "https://google.com");
                assert_eq!(term, "rust async");
            }
            other => panic!("expected search, got {other:?}"),
        }
        assert!(matches!(
            KeywordClassifier::default().classify("open youtube and search \"lofi beats\".", None),
            TaskPlan::Search { term, .. } if term == "lofi beats"
        ));
        // No destination, nothing to search on.
        assert!(matches!(
            KeywordClassifier::default().classify("search for rust", None),
            TaskPlan::Describe
        ));
    }

    #[test]
    fn click_outranks_type() {
        assert_eq!(intent("click the button then type hello"), Some(ActionIntent::Click));
    }

    #[test]
    fn type_extracts_remaining_text() {
        assert_eq!(intent("Type hello world"), Some(ActionIntent::TypeText("hello world".into())));
        assert_eq!(intent("type \"quoted text\""), Some(ActionIntent::TypeText("quoted text".into())));
        assert!(intent("type").is_none());
    }

    #[test]
    fn screenshot_and_describe() {
        assert_eq!(intent("take a screenshot"), Some(ActionIntent::Screenshot));
        assert!(matches!(
            KeywordClassifier::default().classify("what is on this page?", Some("a login form")),
            TaskPlan::Describe
        ));
    }

    #[test]
    fn login_only_when_configured() {
        assert!(matches!(KeywordClassifier::default().classify("login to the portal", None), TaskPlan::Describe));

        let profile = LoginProfile {
            url: "https://portal.example/users/login".into(),
            email: "me@example.org".into(),
            password: "hunter2".into(),
        };
        let classifier = KeywordClassifier::default().with_login(Some(profile));
        match classifier.classify("Log in to the portal", None) {
            TaskPlan::Login(p) => {
                assert_eq!(p.url, "https://portal.example/users/login");
                assert!(!format!("{p:?}").contains("hunter2"));
            }
            other => panic!("expected login, got {other:?}"),
        }
    }
}
