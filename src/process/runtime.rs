//! Runtime detection from command lines and memory maps

use std::path::Path;

use lazy_static::lazy_static;
use regex::bytes::Regex;

lazy_static! {
    static ref PYTHON_CMD: Regex =
        Regex::new(r"^(.*/)?python[23]?(\.\d+)?$").expect("valid python cmd regex");
}

/// Whether a raw `/proc/<pid>/cmdline` belongs to a CPython interpreter.
///
/// Only the first argument is considered; process titles such as
/// `python3: worker` are handled by taking the first whitespace-separated
/// token and trimming a trailing colon.
pub fn is_python_cmdline(cmdline: &[u8]) -> bool {
    let first = match cmdline.split(|b| *b == 0).next() {
        Some(arg) if !arg.is_empty() => arg,
        _ => return false,
    };
    let token = match first
        .split(|b| b.is_ascii_whitespace())
        .find(|t| !t.is_empty())
    {
        Some(t) => t,
        None => return false,
    };
    let token = token.strip_suffix(b":").unwrap_or(token);
    PYTHON_CMD.is_match(token)
}

fn mapped_library(maps: &[String], prefix: &str) -> bool {
    maps.iter().any(|path| {
        Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |name| name.starts_with(prefix))
    })
}

/// Dynamically linked OpenSSL.
pub fn uses_openssl(maps: &[String]) -> bool {
    mapped_library(maps, "libssl.so")
}

/// Application name of a .NET (CoreCLR) process, or None if the process does
/// not host the CLR.
///
/// `dotnet /app/Orders.Api.dll` → `Orders.Api`; an apphost executable
/// `/app/Orders.Api` → `Orders.Api`.
pub fn dotnet_app_name(maps: &[String], cmdline: &[u8], executable: &Path) -> Option<String> {
    if !mapped_library(maps, "libcoreclr.so") {
        return None;
    }
    let dll = cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .find(|arg| arg.ends_with(".dll"));
    if let Some(dll) = dll {
        return Path::new(dll.as_ref())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
    }
    executable
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_cmdlines() {
        assert!(is_python_cmdline(b"python\0app.py\0"));
        assert!(is_python_cmdline(b"/usr/bin/python3\0-m\0http.server\0"));
        assert!(is_python_cmdline(b"/usr/local/bin/python3.11\0manage.py\0"));
        assert!(is_python_cmdline(b"python3: worker process\0"));
        assert!(is_python_cmdline(b"python2.7\0"));
    }

    #[test]
    fn test_non_python_cmdlines() {
        assert!(!is_python_cmdline(b""));
        assert!(!is_python_cmdline(b"\0"));
        assert!(!is_python_cmdline(b"   \0"));
        assert!(!is_python_cmdline(b"/usr/bin/node\0server.js\0"));
        assert!(!is_python_cmdline(b"gunicorn: master\0"));
        assert!(!is_python_cmdline(b"pythonista\0"));
        assert!(!is_python_cmdline(b"/usr/bin/env\0python3\0"));
    }

    #[test]
    fn test_openssl_detection() {
        let maps = vec![
            "/usr/lib/x86_64-linux-gnu/libc.so.6".to_string(),
            "/usr/lib/x86_64-linux-gnu/libssl.so.3".to_string(),
        ];
        assert!(uses_openssl(&maps));
        assert!(!uses_openssl(&maps[..1]));
    }

    #[test]
    fn test_dotnet_app_from_dll_argument() {
        let maps =
            vec!["/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libcoreclr.so".to_string()];
        let name = dotnet_app_name(
            &maps,
            b"dotnet\0/app/Orders.Api.dll\0",
            Path::new("/usr/share/dotnet/dotnet"),
        );
        assert_eq!(name.as_deref(), Some("Orders.Api"));
    }

    #[test]
    fn test_dotnet_app_from_apphost() {
        let maps = vec!["/app/libcoreclr.so".to_string()];
        let name = dotnet_app_name(&maps, b"/app/Billing\0", Path::new("/app/Billing"));
        assert_eq!(name.as_deref(), Some("Billing"));
    }

    #[test]
    fn test_not_dotnet() {
        let maps = vec!["/usr/lib/libc.so.6".to_string()];
        assert_eq!(dotnet_app_name(&maps, b"dotnet\0x.dll\0", Path::new("/usr/bin/dotnet")), None);
    }
}
