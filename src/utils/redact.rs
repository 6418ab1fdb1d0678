use regex::Regex;
use std::sync::OnceLock;

const MASK: &str = "***";

fn url_credentials() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<scheme>[A-Za-z][A-Za-z0-9+.-]*://)[^/@\s]+@").expect("static regex")
    })
}

/// 將工具輸出中的秘密值與 URL 帳密遮蔽後再記錄或回報
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // 先替換較長的值，避免部分覆蓋
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut output = text.to_string();
        for secret in &self.secrets {
            output = output.replace(secret.as_str(), MASK);
        }
        url_credentials()
            .replace_all(&output, format!("${{scheme}}{}@", MASK).as_str())
            .into_owned()
    }

    /// Returns true when any known secret appears verbatim in `text`.
    pub fn contains_secret(&self, text: &str) -> bool {
        self.secrets.iter().any(|s| text.contains(s.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_known_secret_and_url_userinfo() {
        let redactor = Redactor::new(["ghp_abc123"]);
        let out = redactor.redact(
            "token ghp_abc123 used for https://someone:pw@pypi.data.vanoord.com/simple",
        );

        assert_eq!(
            out,
            "token *** used for https://***@pypi.data.vanoord.com/simple"
        );
        assert!(redactor.contains_secret("x ghp_abc123 y"));
        assert!(!redactor.contains_secret("nothing here"));
    }

    #[test]
    fn test_empty_secrets_are_ignored() {
        let redactor = Redactor::new([""]);
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("plain text"), "plain text");
    }
}
