// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tracing_subscriber::EnvFilter;

/// Filter directives for a `-v` count.
pub fn filter_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "fanout=warn",
        1 => "fanout=info",
        // -vv: Include russh debug logs for SSH troubleshooting
        2 => "fanout=debug,russh=debug",
        _ => "fanout=trace,russh=trace",
    }
}

/// Create an environment filter based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(verbosity))
    }
}

/// Install the global subscriber. Logs go to stderr so they never mix with
/// relayed remote output on stdout.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(0), "fanout=warn");
        assert_eq!(filter_directives(1), "fanout=info");
        assert!(filter_directives(2).contains("russh=debug"));
        assert_eq!(filter_directives(9), filter_directives(3));
    }

    #[test]
    #[serial]
    fn test_rust_log_wins() {
        let original = std::env::var("RUST_LOG").ok();
        std::env::set_var("RUST_LOG", "russh=error");
        assert_eq!(create_env_filter(3).to_string(), "russh=error");
        std::env::remove_var("RUST_LOG");
        assert_eq!(create_env_filter(1).to_string(), "fanout=info");
        if let Some(value) = original {
            std::env::set_var("RUST_LOG", value);
        }
    }
}
