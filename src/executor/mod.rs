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

//! Remote command execution: wrapping, running and relaying output.

mod command;
mod input;
pub mod output_sync;
pub mod relay;
mod result;
pub mod wrap;

pub use command::{ExecOptions, ExecRequest, RemoteCommandExecutor};
pub use output_sync::{BufferSink, OutputSink, Stream, TerminalSink};
pub use relay::{OutputRelay, RelayMode, SudoResponder};
pub use result::{CommandResult, ExecOutput, UNKNOWN_EXIT_STATUS};
