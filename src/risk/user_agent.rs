// User agent parsing for client version checks

/// A named client component with its major version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersion {
    pub name: &'static str,
    pub major: u32,
}

/// Browser and operating system derived from a User-Agent string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub platform: String,
    pub browser: Option<ClientVersion>,
    pub os: Option<ClientVersion>,
}

#[must_use]
pub fn parse_user_agent(user_agent: &str) -> UserAgentInfo {
    UserAgentInfo {
        platform: derive_platform_from_user_agent(user_agent),
        browser: detect_browser(user_agent),
        os: detect_os(user_agent),
    }
}

/// Derive platform from User-Agent string
/// Detects common platforms like Windows, macOS, Linux, Android, iOS, Chrome OS
#[must_use]
pub fn derive_platform_from_user_agent(user_agent: &str) -> String {
    let ua_lower = user_agent.to_lowercase();

    if ua_lower.contains("android") {
        "Android".to_string()
    } else if ua_lower.contains("iphone") || ua_lower.contains("ipad") || ua_lower.contains("ios") {
        "iOS".to_string()
    } else if ua_lower.contains("chrome os") || ua_lower.contains("cros") {
        "Chrome OS".to_string()
    } else if ua_lower.contains("windows") {
        "Windows".to_string()
    } else if ua_lower.contains("macintosh") || ua_lower.contains("mac os") {
        "macOS".to_string()
    } else if ua_lower.contains("linux") {
        "Linux".to_string()
    } else {
        "Unknown".to_string()
    }
}

// Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari
fn detect_browser(user_agent: &str) -> Option<ClientVersion> {
    const MARKERS: [(&str, &str); 5] = [
        ("Edg/", "Edge"),
        ("OPR/", "Opera"),
        ("Firefox/", "Firefox"),
        ("Chrome/", "Chrome"),
        ("CriOS/", "Chrome"),
    ];
    for (marker, name) in MARKERS {
        if let Some(major) = major_after(user_agent, marker) {
            return Some(ClientVersion { name, major });
        }
    }
    if user_agent.contains("Safari/") {
        return major_after(user_agent, "Version/").map(|major| ClientVersion {
            name: "Safari",
            major,
        });
    }
    None
}

fn detect_os(user_agent: &str) -> Option<ClientVersion> {
    if let Some(major) = major_after(user_agent, "Android ") {
        return Some(ClientVersion { name: "Android", major });
    }
    if let Some(major) =
        major_after(user_agent, "iPhone OS ").or_else(|| major_after(user_agent, "CPU OS "))
    {
        return Some(ClientVersion { name: "iOS", major });
    }
    if let Some(major) = major_after(user_agent, "Windows NT ") {
        return Some(ClientVersion { name: "Windows", major });
    }
    None
}

/// Leading decimal digits following `marker`
fn major_after(haystack: &str, marker: &str) -> Option<u32> {
    let start = haystack.find(marker)? + marker.len();
    let digits: String = haystack[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
