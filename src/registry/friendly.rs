//! Friendly application names.
//!
//! Attribution yields an executable name (`"chrome"`, `"Google Chrome H"`,
//! `"slack.exe"`); the registry keys applications on a human-readable name
//! mapped from the lowercased executable stem, falling back to a title-cased
//! process name.

/// Static friendly-name table keyed by lowercased executable stem.
pub fn friendly_app_name(stem: &str) -> Option<&'static str> {
    Some(match stem {
        "chrome" | "google chrome" | "google chrome helper" => "Google Chrome",
        "chromium" => "Chromium",
        "firefox" | "firefox-bin" | "firefox-esr" => "Firefox",
        "safari" | "com.apple.webkit.networking" => "Safari",
        "msedge" | "microsoft edge" => "Microsoft Edge",
        "brave" | "brave browser" => "Brave",
        "opera" => "Opera",
        "slack" => "Slack",
        "discord" => "Discord",
        "teams" | "ms-teams" | "microsoft teams" => "Microsoft Teams",
        "zoom" | "zoom.us" => "Zoom",
        "skype" => "Skype",
        "telegram" | "telegram-desktop" => "Telegram",
        "signal" | "signal-desktop" => "Signal",
        "whatsapp" => "WhatsApp",
        "spotify" => "Spotify",
        "vlc" => "VLC",
        "obs" | "obs64" => "OBS Studio",
        "code" | "code helper" | "code - insiders" => "Visual Studio Code",
        "idea" | "idea64" => "IntelliJ IDEA",
        "electron" => "Electron",
        "node" | "nodejs" => "Node.js",
        "python" | "python3" => "Python",
        "java" | "javaw" => "Java",
        "ruby" => "Ruby",
        "cargo" | "rustc" => "Cargo",
        "git" | "git-remote-https" => "Git",
        "curl" => "curl",
        "wget" => "wget",
        "ssh" => "OpenSSH",
        "sshd" => "OpenSSH Server",
        "docker" | "dockerd" | "com.docker.backend" => "Docker",
        "tailscaled" | "tailscale" => "Tailscale",
        "dropbox" => "Dropbox",
        "1password" => "1Password",
        "steam" | "steamwebhelper" => "Steam",
        "transmission" | "transmission-gtk" | "transmission-daemon" => "Transmission",
        "qbittorrent" => "qBittorrent",
        "thunderbird" => "Thunderbird",
        "outlook" => "Microsoft Outlook",
        "mail" => "Apple Mail",
        "postgres" | "postmaster" => "PostgreSQL",
        "mysqld" => "MySQL",
        "redis-server" => "Redis",
        "nginx" => "nginx",
        "httpd" | "apache2" => "Apache HTTP Server",
        "systemd-resolved" => "systemd-resolved",
        "avahi-daemon" => "Avahi",
        "mdnsresponder" => "mDNSResponder",
        _ => return None,
    })
}

/// Strip a trailing extension (`.exe`, `.bin`) and lowercase.
pub fn executable_stem(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 4 => stem,
        _ => base,
    };
    stem.to_lowercase()
}

/// Title-case a process name: `"google chrome helper"` → `"Google Chrome Helper"`.
pub fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Registry-id slug: lowercased with whitespace replaced by `-`.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
