// Copyright 2021 The ADK Developers.
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

//! Commandlets: `--cmdlet <name> [args...]` dispatch to registered tools.
//!
//! The commandlet receives the remaining command line starting at its own
//! name, so it never rescans the full argument list.

/// The flag that selects commandlet mode.
pub const CMDLET_FLAG: &'static str = "--cmdlet";

/// A registered commandlet entry point. Returns a process exit code; zero
/// is success.
pub type CmdletFn = fn(&[String]) -> i32;

/// The commandlet registry.
pub struct Cmdlets {
    entries: Vec<(&'static str, CmdletFn)>,
}

impl Cmdlets {
    /// An empty registry.
    pub fn new() -> Cmdlets {
        Cmdlets {
            entries: Vec::new(),
        }
    }

    /// Register a commandlet by name.
    pub fn register(&mut self, name: &'static str, f: CmdletFn) {
        debug_assert!(self.entries.iter().all(|&(n, _)| n != name));
        self.entries.push((name, f));
    }

    /// Commandlet main entry point. Returns non-zero on error or when no
    /// (or an unknown) commandlet was specified.
    pub fn run(&self, args: &[String]) -> i32 {
        let flag_pos = match args.iter().position(|a| a == CMDLET_FLAG) {
            Some(pos) if pos + 1 < args.len() => pos,
            _ => {
                error!("no commandlet flag ({}) specified", CMDLET_FLAG);
                return -1;
            }
        };
        let name = &args[flag_pos + 1];
        for &(entry_name, f) in &self.entries {
            if entry_name.eq_ignore_ascii_case(name) {
                return f(&args[flag_pos + 1..]);
            }
        }
        error!("no commandlet with name: {}", name);
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn echo_cmdlet(args: &[String]) -> i32 {
        assert_eq!(args[0], "echo_test");
        (args.len() - 1) as i32
    }

    #[test]
    fn dispatches_with_trailing_args() {
        let mut cmdlets = Cmdlets::new();
        cmdlets.register("echo_test", echo_cmdlet);
        let rc = cmdlets.run(&argv(&["app", "--cmdlet", "echo_test", "a", "b"]));
        assert_eq!(rc, 2);
    }

    #[test]
    fn unknown_and_missing_names_fail() {
        let mut cmdlets = Cmdlets::new();
        cmdlets.register("echo_test", echo_cmdlet);
        assert_eq!(cmdlets.run(&argv(&["app", "--cmdlet", "nope"])), -1);
        assert_eq!(cmdlets.run(&argv(&["app"])), -1);
        assert_eq!(cmdlets.run(&argv(&["app", "--cmdlet"])), -1);
    }
}
