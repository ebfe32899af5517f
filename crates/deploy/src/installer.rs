//! Client for the installer helper that runs on the device.
//!
//! The helper is invoked through the device shell and answers on its first
//! output line:
//!
//! | Command | Answers |
//! |---|---|
//! | `dump <app>` | `OK`, `NOT_INSTALLED` |
//! | `swap --package <app> --overlay <id> ...` | `OK`, `OK RESTART_REQUIRED` |
//!
//! Either command may answer `ERROR <CODE> <message>` instead.

use exn::ResultExt;

use crate::device::Device;
use crate::error::{ErrorKind, Result};

/// Root of everything the deployer keeps on a device.
pub const BASE_DIRECTORY: &str = "/data/local/tmp/.studio";
/// `dump` leaves one `<apk>.remotecd` file per installed APK in `<this>/<app>/`.
pub const DUMPS_DIRECTORY: &str = "/data/local/tmp/.studio/dumps";
/// Files pushed for a swap are staged under `<this>/<app>/<apk>/<entry>`.
pub const STAGING_DIRECTORY: &str = "/data/local/tmp/.studio/tmp";

/// First line of an installer answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    /// The swap was recorded in the overlay but the running process could
    /// not redefine the classes.
    RestartRequired,
    NotInstalled,
    Error { code: String, message: String },
}

impl Response {
    pub fn parse(lines: &[String]) -> Result<Self> {
        let Some(line) = lines.iter().map(|line| line.trim()).find(|line| !line.is_empty()) else {
            exn::bail!(ErrorKind::Parse("empty installer response".into()));
        };
        Ok(match line {
            "OK" => Self::Ok,
            "OK RESTART_REQUIRED" => Self::RestartRequired,
            "NOT_INSTALLED" => Self::NotInstalled,
            _ => {
                let Some(error) = line.strip_prefix("ERROR ") else {
                    exn::bail!(ErrorKind::Parse(format!("installer response: {line}")));
                };
                let (code, message) = error.split_once(' ').unwrap_or((error, ""));
                Self::Error { code: code.to_string(), message: message.to_string() }
            }
        })
    }

    pub fn render(&self) -> String {
        match self {
            Self::Ok => "OK".into(),
            Self::RestartRequired => "OK RESTART_REQUIRED".into(),
            Self::NotInstalled => "NOT_INSTALLED".into(),
            Self::Error { code, message } => format!("ERROR {code} {message}"),
        }
    }
}

/// Arguments of one `swap` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapRequest {
    pub package: String,
    /// Overlay the device holds once the swap is applied.
    pub overlay: String,
    /// Overlay the device must currently hold. `None` after a plain install,
    /// where the device has no overlay yet.
    pub expected_overlay: Option<String>,
    /// Restart the application instead of redefining classes in place.
    pub restart: bool,
    /// Staged dex files.
    pub dex: Vec<String>,
    /// Staged non-code files (resources and assets).
    pub resources: Vec<String>,
    /// Classes to redefine, in Java notation.
    pub classes: Vec<String>,
}

impl SwapRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--package".to_string(), self.package.clone(), "--overlay".into(), self.overlay.clone()];
        if let Some(expected) = &self.expected_overlay {
            args.extend(["--expected-overlay".to_string(), expected.clone()]);
        }
        if self.restart {
            args.push("--restart".into());
        }
        for (flag, values) in [("--dex", &self.dex), ("--resource", &self.resources), ("--class", &self.classes)] {
            for value in values {
                args.extend([flag.to_string(), value.clone()]);
            }
        }
        args
    }

    /// Reads back the arguments produced by [`args`](Self::args).
    #[cfg(any(test, feature = "mock"))]
    pub fn parse(args: &[&str]) -> Option<Self> {
        let mut request = Self::default();
        let mut args = args.iter();
        while let Some(flag) = args.next() {
            if *flag == "--restart" {
                request.restart = true;
                continue;
            }
            let value = args.next()?.to_string();
            match *flag {
                "--package" => request.package = value,
                "--overlay" => request.overlay = value,
                "--expected-overlay" => request.expected_overlay = Some(value),
                "--dex" => request.dex.push(value),
                "--resource" => request.resources.push(value),
                "--class" => request.classes.push(value),
                _ => return None,
            }
        }
        (!request.package.is_empty() && !request.overlay.is_empty()).then_some(request)
    }
}

#[derive(Debug, Clone)]
pub struct Installer {
    path: String,
}

impl Installer {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Asks the installer to write central directory dumps of every APK of
    /// `application_id` under [`DUMPS_DIRECTORY`].
    pub fn dump(&self, device: &dyn Device, application_id: &str) -> Result<Response> {
        self.run(device, "dump", &[application_id.to_string()])
    }

    pub fn swap(&self, device: &dyn Device, request: &SwapRequest) -> Result<Response> {
        self.run(device, "swap", &request.args())
    }

    fn run(&self, device: &dyn Device, command: &str, args: &[String]) -> Result<Response> {
        let mut argv = vec![self.path.as_str(), command];
        argv.extend(args.iter().map(String::as_str));
        let lines = device.shell(&argv)?;
        tracing::debug!(serial = device.serial(), command, response = ?lines.first(), "Installer answered");
        Response::parse(&lines).or_raise(|| ErrorKind::DeviceCommunication(format!("installer {command}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(String::from).collect()
    }

    #[rstest]
    #[case::ok("OK", Response::Ok)]
    #[case::leading_blank_line("\nOK\n", Response::Ok)]
    #[case::restart("OK RESTART_REQUIRED", Response::RestartRequired)]
    #[case::not_installed("NOT_INSTALLED", Response::NotInstalled)]
    #[case::error(
        "ERROR OVERLAY_MISMATCH expected abc",
        Response::Error { code: "OVERLAY_MISMATCH".into(), message: "expected abc".into() }
    )]
    #[case::error_without_message("ERROR AGENT", Response::Error { code: "AGENT".into(), message: String::new() })]
    fn parses_responses(#[case] text: &str, #[case] expected: Response) {
        assert_eq!(Response::parse(&lines(text)).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::garbage("sh: installer: not found")]
    fn rejects_unknown_responses(#[case] text: &str) {
        let err = Response::parse(&lines(text)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Parse(_)));
    }

    #[test]
    fn swap_arguments() {
        let request = SwapRequest {
            package: "com.example".into(),
            overlay: "new".into(),
            expected_overlay: Some("old".into()),
            restart: true,
            dex: vec!["/tmp/classes.dex".into()],
            resources: vec!["/tmp/res/a.xml".into()],
            classes: vec!["com.example.A".into(), "com.example.B".into()],
        };
        let args = request.args();
        assert_eq!(
            args,
            [
                "--package",
                "com.example",
                "--overlay",
                "new",
                "--expected-overlay",
                "old",
                "--restart",
                "--dex",
                "/tmp/classes.dex",
                "--resource",
                "/tmp/res/a.xml",
                "--class",
                "com.example.A",
                "--class",
                "com.example.B"
            ]
        );
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        assert_eq!(SwapRequest::parse(&args), Some(request));
        assert_eq!(SwapRequest::parse(&["--package"]), None);
        assert_eq!(SwapRequest::parse(&["--package", "com.example"]), None);
    }
}
