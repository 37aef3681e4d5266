//! Run-script rendering for process-based trial execution.

use sweep_core::ManagerEndpoint;

/// Hyperparameter file written into the trial directory.
pub const PARAMETER_FILE_NAME: &str = "parameter.cfg";

/// Script submitted to the shell.
pub const RUN_SCRIPT_NAME: &str = "run.sh";

/// Exit code of the trial command, written when the script finishes.
pub const EXIT_CODE_FILE: &str = "exit_code";

/// Process-group id of the running script, written before the trial command
/// starts. Only rendered for detached (remote) execution.
pub const PID_FILE: &str = "run.pid";

/// Everything the run script embeds.
#[derive(Debug)]
pub struct ExecScriptParams<'a> {
    pub platform: &'a str,
    pub experiment_id: &'a str,
    pub trial_id: &'a str,
    pub sequence_id: u64,
    /// Trial working directory on the executing host.
    pub trial_dir: &'a str,
    /// Code directory on the executing host.
    pub code_dir: &'a str,
    pub command: &'a str,
    pub manager: &'a ManagerEndpoint,
    /// Empty string disables the trial-side version check.
    pub version: &'a str,
    pub log_collection: &'a str,
    /// Value exported as `CUDA_VISIBLE_DEVICES`; empty hides every GPU.
    pub cuda_devices: &'a str,
    /// Record the shell pid so a detached script can be killed later.
    pub record_pid: bool,
}

/// Renders the script one trial process executes: export the trial
/// environment, run the user command from the code directory with
/// stdout/stderr captured, record the exit code.
#[must_use]
pub fn render_exec_script(p: &ExecScriptParams<'_>) -> String {
    let command = escape_single_quotes(p.command);
    let pid_line =
        if p.record_pid { format!("echo $$ >\"$SWEEP_SYS_DIR/{PID_FILE}\"\n") } else { String::new() };
    format!(
        "#!/bin/sh\n\
         export SWEEP_PLATFORM={platform}\n\
         export SWEEP_EXP_ID={experiment_id}\n\
         export SWEEP_TRIAL_ID={trial_id}\n\
         export SWEEP_SEQ_ID={sequence_id}\n\
         export SWEEP_SYS_DIR={trial_dir}\n\
         export SWEEP_CODE_DIR={code_dir}\n\
         export SWEEP_OUTPUT_DIR={trial_dir}/output\n\
         export SWEEP_PARAM_FILE={trial_dir}/{parameter_file}\n\
         export SWEEP_CALLBACK_URL=http://{manager}\n\
         export SWEEP_VERSION='{version}'\n\
         export SWEEP_LOG_COLLECTION={log_collection}\n\
         export CUDA_VISIBLE_DEVICES={cuda_devices}\n\
         mkdir -p \"$SWEEP_OUTPUT_DIR\"\n\
         cd \"$SWEEP_CODE_DIR\"\n\
         {pid_line}\
         eval '{command}' 1>\"$SWEEP_SYS_DIR/stdout\" 2>\"$SWEEP_SYS_DIR/stderr\"\n\
         echo $? >\"$SWEEP_SYS_DIR/{exit_code_file}\"\n",
        platform = p.platform,
        experiment_id = p.experiment_id,
        trial_id = p.trial_id,
        sequence_id = p.sequence_id,
        trial_dir = p.trial_dir,
        code_dir = p.code_dir,
        parameter_file = PARAMETER_FILE_NAME,
        manager = p.manager,
        version = p.version,
        log_collection = p.log_collection,
        cuda_devices = p.cuda_devices,
        pid_line = pid_line,
        command = command,
        exit_code_file = EXIT_CODE_FILE,
    )
}

/// Makes a command safe to wrap in single quotes.
fn escape_single_quotes(command: &str) -> String {
    command.replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_environment_and_command() {
        let manager = ManagerEndpoint::new("127.0.0.1", 8081);
        let script = render_exec_script(&ExecScriptParams {
            platform: "local",
            experiment_id: "exp42",
            trial_id: "abc12345",
            sequence_id: 3,
            trial_dir: "/tmp/exp42/trials/abc12345",
            code_dir: "/home/ada/code",
            command: "python3 train.py",
            manager: &manager,
            version: "0.1.0",
            log_collection: "none",
            cuda_devices: "0,1",
            record_pid: false,
        });

        assert!(script.contains("export SWEEP_TRIAL_ID=abc12345"));
        assert!(script.contains("export CUDA_VISIBLE_DEVICES=0,1"));
        assert!(script.contains("cd \"$SWEEP_CODE_DIR\""));
        assert!(script.contains("eval 'python3 train.py'"));
        assert!(!script.contains(PID_FILE));
    }

    #[test]
    fn detached_script_records_its_pid_before_the_command() {
        let manager = ManagerEndpoint::new("10.0.0.5", 8081);
        let script = render_exec_script(&ExecScriptParams {
            platform: "remote",
            experiment_id: "exp42",
            trial_id: "abc12345",
            sequence_id: 0,
            trial_dir: "/tmp/sweep-exp42/trials/abc12345",
            code_dir: "/tmp/sweep-exp42/trials/abc12345/code",
            command: "sleep 60",
            manager: &manager,
            version: "",
            log_collection: "none",
            cuda_devices: "",
            record_pid: true,
        });

        let pid = script.find("run.pid").unwrap();
        let run = script.find("eval 'sleep 60'").unwrap();
        assert!(pid < run);
    }
}
