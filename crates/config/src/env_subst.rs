/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config text.
///
/// Unset variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();
        let mut body = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            body.push(c);
        }
        if !closed || body.is_empty() {
            // Malformed, emit literally.
            result.push_str("${");
            result.push_str(&body);
            continue;
        }

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body.as_str(), None),
        };
        match (lookup(name), fallback) {
            (Some(val), _) => result.push_str(&val),
            (None, Some(fallback)) => result.push_str(fallback),
            (None, None) => {
                result.push_str("${");
                result.push_str(&body);
                result.push('}');
            },
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        (name == "HERALD_BRIDGE").then(|| "ws://bridge:7700".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("url = \"${HERALD_BRIDGE}\"", lookup),
            "url = \"ws://bridge:7700\""
        );
    }

    #[test]
    fn falls_back_when_unset() {
        assert_eq!(substitute_with("${HERALD_MISSING:-5}", lookup), "5");
        assert_eq!(
            substitute_with("${HERALD_BRIDGE:-ws://local}", lookup),
            "ws://bridge:7700"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_with("${HERALD_NONEXISTENT_XYZ}", lookup),
            "${HERALD_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn keeps_malformed_and_plain_text() {
        assert_eq!(substitute_with("plain text", lookup), "plain text");
        assert_eq!(substitute_with("cost: $5 ${open", lookup), "cost: $5 ${open");
    }
}
