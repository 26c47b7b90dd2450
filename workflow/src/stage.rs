use anyhow::Result;
use regex::Regex;

use syntax::ast;
use util::{split_list, HashMap, Hasher};

use crate::{Error, INCAR_KEY_PREFIX};

const KNOWN_KEYS: [&str; 25] = [
    "step_no",
    "cal_name",
    "copy_which_step",
    "additional_cal_dependence",
    "job_submission_script",
    "job_submission_command",
    "job_query_command",
    "job_killing_command",
    "where_to_parse_queue_id",
    "re_to_parse_queue_id",
    "queue_stdout_file_prefix",
    "queue_stdout_file_suffix",
    "queue_stderr_file_prefix",
    "queue_stderr_file_suffix",
    "max_error_times",
    "program_output",
    "copy_files",
    "contcar_to_poscar",
    "remove_incar_tags",
    "extra_backup_files",
    "remove_after_cal",
    "post_process_command",
    "sub_dir_cal_cmd",
    "manual_input_check",
    "priority_submission",
];

const DEFAULT_MAX_ERROR_TIMES: usize = 5;
const DEFAULT_PROGRAM_OUTPUT: &str = "out";
const DEFAULT_COPY_FILES: &str = "INCAR, POSCAR, KPOINTS, POTCAR";

/// Matches queue-written files by name, e.g. `slurm-1234.out` with prefix `slurm-` and suffix `.out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatcher {
    pub prefix: String,
    pub suffix: String,
}

impl FileMatcher {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        }
    }

    /// true if `name` starts with the prefix and ends with the suffix (without overlap).
    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }
}

/// Everything needed to talk to the batch queue on behalf of one stage.
#[derive(Debug, Clone)]
pub struct QueueCommands {
    /// run in the job dir; expected to write `id_file`
    pub submit: String,
    /// prints one line per queued job
    pub query: String,
    /// the queue id is appended as the last argument
    pub kill: String,
    /// file (relative to the job dir) holding the submission command's output
    pub id_file: String,
    /// must match exactly once in `id_file`
    pub id_regex: Regex,
}

/// One stage of the pipeline. Built once from a workflow file block, never mutated.
#[derive(Debug, Clone)]
pub struct Stage {
    pub step_no: u32,
    pub cal_name: String,
    /// `step_<n>_<cal_name>`, the job dir name inside each material folder
    pub dir_name: String,
    /// 0 means the material folder itself
    pub copy_which_step: u32,
    pub extra_dependencies: Vec<u32>,
    pub queue: QueueCommands,
    pub submission_script: Option<String>,
    pub stdout: FileMatcher,
    pub stderr: FileMatcher,
    pub max_error_times: usize,
    pub program_output: String,
    pub copy_files: Vec<String>,
    pub contcar_to_poscar: bool,
    pub new_incar_tags: Vec<(String, String)>,
    pub remove_incar_tags: Vec<String>,
    pub extra_backup_files: Vec<String>,
    pub remove_after_cal: Vec<String>,
    pub post_process_command: Option<String>,
    pub sub_dir_cal_cmd: Option<String>,
    pub manual_input_check: bool,
    /// prepared jobs are marked `__prior_ready__` instead of `__ready__`
    pub priority_submission: bool,
}

impl Stage {
    /// Build a `Stage` from one parsed block.
    pub fn from_block(block: &ast::Block) -> Result<Self> {
        let mut fields = Fields::collect(block)?;
        let new_incar_tags = std::mem::take(&mut fields.incar);

        let step_no: u32 = fields.number("step_no")?;
        if step_no == 0 {
            return Err(Error::StepZero(fields.line).into());
        }
        let cal_name = fields.required("cal_name")?.to_owned();
        let dir_name = format!("step_{}_{}", step_no, cal_name.replace(' ', "_"));

        let copy_which_step = match fields.optional("copy_which_step") {
            Some(_) => fields.number("copy_which_step")?,
            None => step_no.saturating_sub(1),
        };

        let mut extra_dependencies = Vec::with_capacity(2);
        if let Some(deps) = fields.optional("additional_cal_dependence") {
            for dep in split_list(deps) {
                let dep = dep.parse().map_err(|_| {
                    Error::InvalidValue(fields.line, "additional_cal_dependence", dep.to_owned())
                })?;
                extra_dependencies.push(dep);
            }
        }

        let id_regex = Regex::new(fields.required("re_to_parse_queue_id")?)
            .map_err(|e| Error::InvalidRegex(fields.line, e))?;
        let queue = QueueCommands {
            submit: fields.required("job_submission_command")?.to_owned(),
            query: fields.required("job_query_command")?.to_owned(),
            kill: fields.required("job_killing_command")?.to_owned(),
            id_file: fields.required("where_to_parse_queue_id")?.to_owned(),
            id_regex,
        };

        let stdout = fields.matcher("stdout")?;
        let stderr = fields.matcher("stderr")?;

        let max_error_times = match fields.optional("max_error_times") {
            Some(_) => fields.number("max_error_times")?,
            None => DEFAULT_MAX_ERROR_TIMES,
        };

        Ok(Self {
            step_no,
            cal_name,
            dir_name,
            copy_which_step,
            extra_dependencies,
            queue,
            submission_script: fields.optional("job_submission_script").map(str::to_owned),
            stdout,
            stderr,
            max_error_times,
            program_output: fields
                .optional("program_output")
                .unwrap_or(DEFAULT_PROGRAM_OUTPUT)
                .to_owned(),
            copy_files: fields.list("copy_files", DEFAULT_COPY_FILES),
            contcar_to_poscar: fields.flag("contcar_to_poscar", true)?,
            new_incar_tags,
            remove_incar_tags: fields
                .list("remove_incar_tags", "")
                .into_iter()
                .map(|tag| tag.to_uppercase())
                .collect(),
            extra_backup_files: fields.list("extra_backup_files", ""),
            remove_after_cal: fields.list("remove_after_cal", ""),
            post_process_command: fields.optional("post_process_command").map(str::to_owned),
            sub_dir_cal_cmd: fields.optional("sub_dir_cal_cmd").map(str::to_owned),
            manual_input_check: fields.flag("manual_input_check", false)?,
            priority_submission: fields.flag("priority_submission", false)?,
        })
    }

    /// Steps whose jobs must be complete before this stage's job can be prepared.
    /// Step 0 (the material folder) is always available and is not listed.
    pub fn dependencies(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.copy_which_step)
            .chain(self.extra_dependencies.iter().copied())
            .filter(|&step| step != 0)
    }

    /// true if a `done` job of this stage should be cleaned up/analyzed.
    pub fn has_post_processing(&self) -> bool {
        !self.remove_after_cal.is_empty() || self.post_process_command.is_some()
    }
}

/// Lower-cased view of a block's entries, with `incar.*` keys split out.
struct Fields<'a> {
    line: usize,
    map: HashMap<String, &'a str>,
    incar: Vec<(String, String)>,
}

impl<'a> Fields<'a> {
    fn collect(block: &ast::Block<'a>) -> Result<Self, Error> {
        let mut map = HashMap::with_capacity_and_hasher(block.entries.len(), Hasher::default());
        let mut incar = Vec::with_capacity(4);
        for kv in &block.entries {
            let key = kv.key.to_lowercase();
            if let Some(tag) = key.strip_prefix(INCAR_KEY_PREFIX) {
                incar.push((tag.to_uppercase(), kv.val.to_owned()));
                continue;
            }
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(Error::UnknownKey(block.line, kv.key.to_owned()));
            }
            if map.insert(key, kv.val).is_some() {
                return Err(Error::DuplicateKey(block.line, kv.key.to_owned()));
            }
        }
        Ok(Self {
            line: block.line,
            map,
            incar,
        })
    }

    /// present and non-empty
    fn optional(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).copied().filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<&'a str, Error> {
        self.optional(key).ok_or(Error::MissingKey(self.line, key))
    }

    fn number<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, Error> {
        let val = self.required(key)?;
        val.parse()
            .map_err(|_| Error::InvalidValue(self.line, key, val.to_owned()))
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, Error> {
        match self.optional(key).map(str::to_lowercase).as_deref() {
            None => Ok(default),
            Some("yes" | "true") => Ok(true),
            Some("no" | "false") => Ok(false),
            Some(other) => Err(Error::InvalidValue(self.line, key, other.to_owned())),
        }
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        split_list(self.optional(key).unwrap_or(default))
            .map(str::to_owned)
            .collect()
    }

    /// `which` is "stdout" or "stderr".
    fn matcher(&self, which: &'static str) -> Result<FileMatcher, Error> {
        let prefix_key = format!("queue_{which}_file_prefix");
        let suffix_key = format!("queue_{which}_file_suffix");
        let prefix = self.map.get(prefix_key.as_str()).copied().unwrap_or("");
        let suffix = match self.map.get(suffix_key.as_str()) {
            Some(suffix) => *suffix,
            None if which == "stdout" => ".out",
            None => ".err",
        };
        if prefix.is_empty() && suffix.is_empty() {
            return Err(Error::EmptyMatcher(self.line, which));
        }
        Ok(FileMatcher::new(prefix, suffix))
    }
}
