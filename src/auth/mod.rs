use axum::http::{header, HeaderMap};


/// Extract the authenticated user id from the identity cookie
///
/// Expected format: "Cookie: <name>=<user_id>; other=..."
/// The hosting application sets this cookie once the user has signed in.
pub fn extract_session_user(headers: &HeaderMap, cookie_name: &str) -> Result<String, IdentityError> {
    let mut found = None;

    // Browsers may split cookies across several headers
    for value in headers.get_all(header::COOKIE) {
        let value = value.to_str().map_err(|_| IdentityError::InvalidFormat)?;
        if let Some(user) = find_cookie(value, cookie_name) {
            found = Some(user);
            break;
        }
    }

    let user_id = found.ok_or(IdentityError::Missing)?;

    // Validate not empty
    if user_id.is_empty() {
        return Err(IdentityError::Empty);
    }

    Ok(user_id)
}

/// Find a cookie value in a `Cookie` header value
///
/// Internal helper for extract_session_user
fn find_cookie(header_value: &str, cookie_name: &str) -> Option<String> {
    header_value
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
}

/// Identity extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum IdentityError {
    /// Identity cookie not present
    Missing,
    /// Cookie header is not valid text
    InvalidFormat,
    /// Cookie present but carries no user id
    Empty,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Missing => write!(f, "Identity cookie not provided"),
            IdentityError::InvalidFormat => write!(f, "Invalid cookie header"),
            IdentityError::Empty => write!(f, "Identity cookie is empty"),
        }
    }
}

impl std::error::Error for IdentityError {}
