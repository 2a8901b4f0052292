#![allow(clippy::option_map_unit_fn)]

pub use which;
use {
    anyhow::{anyhow, Context, Result},
    itertools::Itertools,
    list_output::{ListOutput, ListOutputEntry},
    std::{
        collections::BTreeMap,
        ffi::{OsStr, OsString},
        io::{BufRead, BufReader},
        iter::once,
        path::{Path, PathBuf},
        process::{Child, Command, ExitStatus, Output, Stdio},
        str::FromStr,
        sync::Arc,
    },
    tap::prelude::*,
    tracing::instrument,
};

pub mod list_output;
pub mod pattern_file;

/// conventional exit codes of the native archive tool - anything else is treated
/// as [`ToolExitKind::Other`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ToolExitKind {
    #[display("success")]
    Success,
    #[display("warning (non fatal)")]
    Warning,
    #[display("fatal error")]
    Fatal,
    #[display("command line error")]
    CommandLine,
    #[display("not enough memory")]
    OutOfMemory,
    #[display("user stopped the process, corrupted archive or not enough disk space")]
    CorruptionOrSpace,
    #[display("unknown exit code")]
    Other,
}

impl ToolExitKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Warning,
            2 => Self::Fatal,
            7 => Self::CommandLine,
            8 => Self::OutOfMemory,
            255 => Self::CorruptionOrSpace,
            _ => Self::Other,
        }
    }
}

/// a platform-native binary the engine shells out to.
///
/// two implementations exist: [`HostTool`] runs binaries built for the host, and
/// [`TranslatedTool`] runs foreign binaries through a compatibility runner - the
/// only difference visible to callers is how absolute paths are spelled in
/// the argument list, which is why [`NativeTool::translate`] is part of the contract.
pub trait NativeTool: Send + Sync + std::fmt::Debug {
    fn spawn(&self, args: &[OsString], working_dir: Option<&Path>, env: &[(OsString, OsString)]) -> Result<RunningTool>;
    /// maps a host absolute path into the form the tool expects in its argument list.
    /// must be injective, and the tool must produce files the host can find back
    /// under the untranslated path.
    fn translate(&self, path: &Path) -> Result<String>;
}

#[derive(Debug)]
pub struct RunningTool {
    child: Child,
    command_debug: String,
}

impl RunningTool {
    /// line-buffered stdout of the running process - callers scan it for progress markers
    pub fn stdout_lines(&mut self) -> Result<impl Iterator<Item = std::io::Result<String>> + '_> {
        self.child
            .stdout
            .as_mut()
            .context("stdout was not piped")
            .map(|stdout| BufReader::new(stdout).lines())
    }
    pub fn wait(mut self) -> Result<(ExitStatus, String)> {
        let stderr = self
            .child
            .stderr
            .take()
            .map(|stderr| {
                String::new().pipe(|mut out| {
                    BufReader::new(stderr)
                        .lines()
                        .map_while(|line| line.ok())
                        .for_each(|line| {
                            out.push_str(&line);
                            out.push('\n');
                        });
                    out
                })
            })
            .unwrap_or_default();
        self.child
            .wait()
            .context("waiting for process")
            .map(|status| (status, stderr))
            .with_context(|| format!("when running [{}]", self.command_debug))
    }
    pub fn kill(mut self) -> Result<()> {
        self.child.kill().context("killing process tree")
    }
}

#[extension_traits::extension(pub trait CommandExt)]
impl Command {
    fn command_debug(&self) -> String {
        let command = self.get_program().to_string_lossy().to_string();
        self.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .pipe(|args| once(command).chain(args).collect::<Vec<_>>())
            .join(" ")
    }
    fn read_stdout_ok(mut self) -> Result<String> {
        let dbg = self.command_debug();
        self.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("spawning command")
            .and_then(|Output { status, stdout, stderr }| {
                status
                    .success()
                    .then_some(())
                    .ok_or_else(|| status.code().unwrap_or(-1))
                    .map_err(|code| anyhow!("command failed with status [{code}] ({})", ToolExitKind::from_code(code)))
                    .with_context(|| String::from_utf8_lossy(&stderr).to_string())
                    .and_then(|_| {
                        stdout
                            .pipe(String::from_utf8)
                            .context("output is not a string")
                    })
            })
            .with_context(|| format!("when executing [{dbg}]"))
    }
}

fn check_exists(file: &Path) -> Result<&Path> {
    file.try_exists()
        .context("checking for existence of the provided binary")
        .and_then(|exists| exists.then_some(file).context("checking if file exists"))
        .with_context(|| format!("checking if file exists: [{}]", file.display()))
}

/// runs binaries compiled for the host platform as-is
#[derive(Clone, Debug)]
pub struct HostTool {
    bin: Arc<Path>,
}

impl HostTool {
    pub fn new(bin: &Path) -> Result<Self> {
        check_exists(bin)
            .map(Arc::from)
            .map(|bin| Self { bin })
            .with_context(|| format!("instantiating host tool at [{}]", bin.display()))
    }
}

fn spawn_with(mut command: Command) -> Result<RunningTool> {
    let command_debug = command.command_debug();
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .with_context(|| format!("spawning [{command_debug}]"))
        .map(|child| RunningTool { child, command_debug })
}

impl NativeTool for HostTool {
    fn spawn(&self, args: &[OsString], working_dir: Option<&Path>, env: &[(OsString, OsString)]) -> Result<RunningTool> {
        Command::new(self.bin.as_ref())
            .tap_mut(|command| {
                command.args(args);
                working_dir.map(|dir| command.current_dir(dir));
                env.iter().for_each(|(key, value)| {
                    command.env(key, value);
                });
            })
            .pipe(spawn_with)
    }
    fn translate(&self, path: &Path) -> Result<String> {
        Ok(path.display().to_string())
    }
}

/// runs foreign-platform binaries through a compatibility runner (the runner gets
/// the foreign binary as its first argument).
///
/// paths in the argument list must be pre-translated to the foreign convention:
/// `/abs/path` becomes `<drive>:\abs\path`, which the runner maps back onto the
/// host file system (the mapping is invertible by construction).
#[derive(Clone, Debug)]
pub struct TranslatedTool {
    runner: Arc<Path>,
    bin: Arc<Path>,
    drive: char,
}

impl TranslatedTool {
    pub const DEFAULT_DRIVE: char = 'Z';
    pub fn new(runner: &Path, bin: &Path) -> Result<Self> {
        check_exists(runner)
            .and_then(|runner| check_exists(bin).map(|bin| (runner, bin)))
            .map(|(runner, bin)| Self {
                runner: Arc::from(runner),
                bin: Arc::from(bin),
                drive: Self::DEFAULT_DRIVE,
            })
            .with_context(|| format!("instantiating translated tool [{}] under [{}]", bin.display(), runner.display()))
    }
}

impl NativeTool for TranslatedTool {
    fn spawn(&self, args: &[OsString], working_dir: Option<&Path>, env: &[(OsString, OsString)]) -> Result<RunningTool> {
        Command::new(self.runner.as_ref())
            .tap_mut(|command| {
                command.arg(self.bin.as_ref());
                command.args(args);
                working_dir.map(|dir| command.current_dir(dir));
                env.iter().for_each(|(key, value)| {
                    command.env(key, value);
                });
            })
            .pipe(spawn_with)
    }
    fn translate(&self, path: &Path) -> Result<String> {
        path.is_absolute()
            .then_some(path)
            .with_context(|| format!("only absolute paths can be translated: [{}]", path.display()))
            .map(|path| {
                path.iter()
                    .filter(|segment| *segment != OsStr::new("/"))
                    .map(|segment| segment.to_string_lossy())
                    .join("\\")
                    .pipe(|tail| format!("{}:\\{tail}", self.drive))
            })
    }
}

/// handle over the platform archive tool (the 7z flavour) - knows how to list
/// and extract, leaves retry policy to the caller
#[derive(Clone, Debug)]
pub struct ArchiveTool {
    tool: Arc<dyn NativeTool>,
}

pub const ARCHIVE_TOOL_BINARIES: &[&str] = &["7z", "7zz", "7z.exe"];
pub const PAYLOAD_TOOL_BINARIES: &[&str] = &["innoextract", "innoextract.exe"];

pub fn find_host_bin(candidates: &[&str]) -> Result<HostTool> {
    candidates
        .iter()
        .find_map(|bin| which::which(bin).ok())
        .with_context(|| format!("none of {candidates:?} found on PATH"))
        .and_then(|bin| HostTool::new(&bin))
}

impl ArchiveTool {
    pub fn new(tool: Arc<dyn NativeTool>) -> Self {
        Self { tool }
    }
    pub fn find_host() -> Result<Self> {
        find_host_bin(ARCHIVE_TOOL_BINARIES)
            .map(|tool| Self::new(Arc::new(tool)))
            .context("no archive tool binary")
    }
    #[instrument(level = "TRACE")]
    pub fn list(&self, archive: &Path) -> Result<Vec<ListOutputEntry>> {
        self.tool.translate(archive).and_then(|archive| {
            self.spawn_capture(&["l".into(), "-slt".into(), "-sccUTF-8".into(), archive.clone().into()])
                .and_then(|output| ListOutput::from_str(&output).with_context(|| format!("unexpected output from list command:\n{output}")))
                .map(|ListOutput { entries }| entries)
                .with_context(|| format!("listing [{archive}]"))
        })
    }
    fn spawn_capture(&self, args: &[OsString]) -> Result<String> {
        let mut running = self.tool.spawn(args, None, &[])?;
        let mut captured = String::new();
        running.stdout_lines().map(|lines| {
            lines.map_while(|line| line.ok()).for_each(|line| {
                captured.push_str(&line);
                captured.push('\n');
            })
        })?;
        running.wait().and_then(|(status, stderr)| {
            status
                .success()
                .then_some(captured)
                .ok_or_else(|| anyhow!("command failed with [{status}]"))
                .with_context(|| stderr)
        })
    }
    /// performs one extraction attempt:
    /// `x -y -o<dest> <source> [@<pattern-file>] -mmt=off`, watching stdout for
    /// `NNN%` markers which are forwarded to `on_percent`
    #[instrument(skip(on_percent), level = "DEBUG")]
    pub fn extract(&self, archive: &Path, dest: &Path, pattern_file: Option<&Path>, mut on_percent: impl FnMut(u8)) -> Result<()> {
        let args = empty_args()
            .chain(once(OsString::from("x")))
            .chain(once(OsString::from("-y")))
            .chain(once(OsString::from("-bsp1")))
            .chain(once(self.tool.translate(dest).map(|dest| OsString::from(format!("-o{dest}")))?))
            .chain(once(self.tool.translate(archive).map(OsString::from)?))
            .chain(
                pattern_file
                    .map(|pattern_file| self.tool.translate(pattern_file).map(|p| OsString::from(format!("@{p}"))))
                    .transpose()?
                    .into_iter(),
            )
            .chain(once(OsString::from("-mmt=off")))
            .collect_vec();
        let mut running = self.tool.spawn(&args, None, &[])?;
        running.stdout_lines().map(|lines| {
            lines
                .map_while(|line| line.ok())
                .filter_map(|line| parse_percent_marker(&line))
                .for_each(&mut on_percent)
        })?;
        running
            .wait()
            .and_then(|(status, stderr)| match status.code() {
                Some(0) => Ok(()),
                code => {
                    let code = code.unwrap_or(-1);
                    Err(anyhow!("archive tool exited with [{code}] ({})", ToolExitKind::from_code(code)))
                        .with_context(|| stderr)
                        .context(ExitCodeCarrier(code))
                }
            })
            .with_context(|| format!("extracting [{}] into [{}]", archive.display(), dest.display()))
    }
}

fn empty_args() -> std::iter::Empty<OsString> {
    std::iter::empty()
}

/// carried through the context chain so the dispatcher can recover the raw exit
/// code for its retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("tool exit code [{_0}]")]
pub struct ExitCodeCarrier(#[error(not(source))] pub i32);

pub fn exit_code_of(error: &anyhow::Error) -> Option<i32> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ExitCodeCarrier>())
        .map(|ExitCodeCarrier(code)| *code)
}

pub fn parse_percent_marker(line: &str) -> Option<u8> {
    line.split_once('%').and_then(|(before, _)| {
        before
            .trim_end()
            .pipe(|before| {
                before
                    .rfind(|c: char| !c.is_ascii_digit())
                    .map(|idx| &before[idx + 1..])
                    .unwrap_or(before)
            })
            .pipe(|digits| match digits.is_empty() {
                true => None,
                false => digits.parse::<u8>().ok().filter(|p| *p <= 100),
            })
    })
}

/// handle over the installer-payload tool - extracts the payload of installer
/// executables into a destination directory
#[derive(Clone, Debug)]
pub struct PayloadTool {
    tool: Arc<dyn NativeTool>,
}

impl PayloadTool {
    pub fn new(tool: Arc<dyn NativeTool>) -> Self {
        Self { tool }
    }
    pub fn find_host() -> Result<Self> {
        find_host_bin(PAYLOAD_TOOL_BINARIES)
            .map(|tool| Self::new(Arc::new(tool)))
            .context("no installer-payload tool binary")
    }
    #[instrument(level = "DEBUG")]
    pub fn extract(&self, installer: &Path, dest: &Path) -> Result<()> {
        empty_args()
            .chain(once(OsString::from("--extract")))
            .chain(once(OsString::from("--silent")))
            .chain(once(OsString::from("--output-dir")))
            .chain(once(self.tool.translate(dest).map(OsString::from)?))
            .chain(once(self.tool.translate(installer).map(OsString::from)?))
            .collect_vec()
            .pipe(|args| self.tool.spawn(&args, None, &[]))
            .and_then(|running| running.wait())
            .and_then(|(status, stderr)| match status.code() {
                Some(0) => Ok(()),
                code => {
                    let code = code.unwrap_or(-1);
                    Err(anyhow!("payload tool exited with [{code}]"))
                        .with_context(|| stderr)
                        .context(ExitCodeCarrier(code))
                }
            })
            .with_context(|| format!("extracting installer payload of [{}] into [{}]", installer.display(), dest.display()))
    }
}

/// maps entries found under an extraction destination back to the paths they
/// were requested under (tools differ on case and slash direction)
pub fn entry_lookup<'a>(requested: impl IntoIterator<Item = &'a Path>) -> BTreeMap<String, &'a Path> {
    requested
        .into_iter()
        .map(|path| (normalized_key(&path.to_string_lossy()), path))
        .collect()
}

pub fn normalized_key(path: &str) -> String {
    path.replace('\\', "/")
        .to_lowercase()
        .pipe(|path| path.trim_start_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_percent_markers() {
        assert_eq!(parse_percent_marker("  3% 12 - textures/a.dds"), Some(3));
        assert_eq!(parse_percent_marker("100% 99"), Some(100));
        assert_eq!(parse_percent_marker("Extracting archive: foo.7z"), None);
        assert_eq!(parse_percent_marker("%"), None);
        assert_eq!(parse_percent_marker("999% bogus"), None);
    }

    #[test]
    fn test_normalized_key() {
        assert_eq!(normalized_key(r"Textures\A.DDS"), "textures/a.dds");
        assert_eq!(normalized_key("/meshes/b.nif"), "meshes/b.nif");
    }
}
