//! Instance-name substitution for addon-contributed keys.
//!
//! Addons publish their output slots under template keys containing the
//! [`PLACEHOLDER`] token. When a pipeline is built the template is bound to
//! the instance name, with camel-case joins applied automatically so that
//! `"{name}Loading"` bound to `"user"` becomes `"userLoading"` and
//! `"query{name}"` becomes `"queryUser"`. Keys without the token are not
//! name-scoped and are dropped from the output mapping.

/// Token substituted with the instance name.
pub const PLACEHOLDER: &str = "{name}";

/// Binds `key` to `name`.
///
/// Returns `None` when the key does not contain the placeholder. Each
/// occurrence is replaced positionally: an occurrence at the very start of
/// the key takes the name with a lower-cased initial, any later occurrence
/// takes an upper-cased initial, and a key that is exactly the placeholder
/// takes the name verbatim.
///
/// # Example
///
/// ```
/// use calltrack_core::naming::rewrite_key;
///
/// assert_eq!(rewrite_key("{name}Loading", "user"), Some("userLoading".into()));
/// assert_eq!(rewrite_key("query{name}", "user"), Some("queryUser".into()));
/// assert_eq!(rewrite_key("{name}", "User"), Some("User".into()));
/// assert_eq!(rewrite_key("version", "user"), None);
/// ```
#[must_use]
pub fn rewrite_key(key: &str, name: &str) -> Option<String> {
    if !key.contains(PLACEHOLDER) {
        return None;
    }
    if key == PLACEHOLDER {
        return Some(name.to_string());
    }
    let mut out = String::with_capacity(key.len() + name.len());
    let mut rest = key;
    let mut first = true;
    while let Some(idx) = rest.find(PLACEHOLDER) {
        out.push_str(&rest[..idx]);
        if first && idx == 0 {
            out.push_str(&lower_initial(name));
        } else {
            out.push_str(&upper_initial(name));
        }
        rest = &rest[idx + PLACEHOLDER.len()..];
        first = false;
    }
    out.push_str(rest);
    Some(out)
}

/// `name` with its first character lower-cased (full Unicode folding, so
/// the initial may expand to several characters).
#[must_use]
pub fn lower_initial(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(head) => head.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `name` with its first character upper-cased.
#[must_use]
pub fn upper_initial(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(head) => head.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_placeholder_takes_name_verbatim() {
        assert_eq!(rewrite_key("{name}", "user"), Some("user".to_string()));
        // Verbatim means no case folding either way.
        assert_eq!(rewrite_key("{name}", "User"), Some("User".to_string()));
    }

    #[test]
    fn leading_placeholder_lowers_the_initial() {
        assert_eq!(
            rewrite_key("{name}Loading", "user"),
            Some("userLoading".to_string())
        );
        assert_eq!(
            rewrite_key("{name}Error", "UserQuery"),
            Some("userQueryError".to_string())
        );
    }

    #[test]
    fn interior_placeholder_uppers_the_initial() {
        assert_eq!(
            rewrite_key("query{name}", "user"),
            Some("queryUser".to_string())
        );
        assert_eq!(
            rewrite_key("reload{name}Now", "user"),
            Some("reloadUserNow".to_string())
        );
    }

    #[test]
    fn each_occurrence_is_folded_positionally() {
        assert_eq!(
            rewrite_key("{name}By{name}", "user"),
            Some("userByUser".to_string())
        );
        assert_eq!(
            rewrite_key("map{name}To{name}", "item"),
            Some("mapItemToItem".to_string())
        );
    }

    #[test]
    fn keys_without_the_placeholder_are_dropped() {
        assert_eq!(rewrite_key("version", "user"), None);
        assert_eq!(rewrite_key("", "user"), None);
        assert_eq!(rewrite_key("{Name}", "user"), None);
    }

    #[test]
    fn folding_is_unicode_aware() {
        assert_eq!(
            rewrite_key("fetch{name}", "école"),
            Some("fetchÉcole".to_string())
        );
        assert_eq!(
            rewrite_key("{name}Liste", "École"),
            Some("écoleListe".to_string())
        );
        // One-to-many folds expand rather than truncate.
        assert_eq!(
            rewrite_key("load{name}", "ßeta"),
            Some("loadSSeta".to_string())
        );
    }

    #[test]
    fn empty_name_still_binds() {
        assert_eq!(rewrite_key("{name}Loading", ""), Some("Loading".to_string()));
        assert_eq!(rewrite_key("{name}", ""), Some(String::new()));
    }

    proptest! {
        #[test]
        fn bound_keys_never_retain_the_placeholder(
            prefix in "[a-zA-Z]{0,8}",
            suffix in "[a-zA-Z]{0,8}",
            name in "[a-zA-Z]{1,8}",
        ) {
            let key = format!("{prefix}{PLACEHOLDER}{suffix}");
            let bound = rewrite_key(&key, &name);
            prop_assert!(bound.is_some());
            if let Some(bound) = bound {
                prop_assert!(!bound.contains(PLACEHOLDER));
                prop_assert!(bound.to_lowercase().contains(&name.to_lowercase()));
            }
        }

        #[test]
        fn plain_keys_are_always_dropped(key in "[a-zA-Z]{0,16}", name in "[a-zA-Z]{1,8}") {
            prop_assert_eq!(rewrite_key(&key, &name), None);
        }
    }
}
