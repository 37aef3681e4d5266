//! Run-script rendering for in-pod trial execution.

use sweep_core::ManagerEndpoint;

/// Mount path of the cluster storage inside trial containers.
pub const CONTAINER_MOUNT_PATH: &str = "/mnt/sweep";

/// Hyperparameter file written next to the run scripts.
pub const PARAMETER_FILE_NAME: &str = "parameter.cfg";

/// Everything a role's run script embeds.
#[derive(Debug)]
pub struct RunScriptParams<'a> {
    pub platform: &'a str,
    pub experiment_id: &'a str,
    pub trial_id: &'a str,
    pub sequence_id: u64,
    pub role: &'a str,
    pub command: &'a str,
    /// Container-side trial working directory (on the mounted storage).
    pub trial_dir: &'a str,
    /// Container-side shared code directory.
    pub code_dir: &'a str,
    pub manager: &'a ManagerEndpoint,
    /// Empty string disables the trial-side version check.
    pub version: &'a str,
    pub log_collection: &'a str,
}

#[must_use]
pub fn run_script_name(role: &str) -> String {
    format!("run_{role}.sh")
}

/// Renders the script one pod role executes: export the trial environment,
/// stage the shared code into the working directory, run the user command
/// with stdout/stderr captured, record the exit code.
#[must_use]
pub fn render_run_script(p: &RunScriptParams<'_>) -> String {
    let command = escape_single_quotes(p.command);
    format!(
        "#!/bin/bash\n\
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
         mkdir -p \"$SWEEP_OUTPUT_DIR\"\n\
         cp -r \"$SWEEP_CODE_DIR/.\" \"$SWEEP_SYS_DIR\"\n\
         cd \"$SWEEP_SYS_DIR\"\n\
         eval '{command}' 1>\"$SWEEP_OUTPUT_DIR/{role}.stdout\" 2>\"$SWEEP_OUTPUT_DIR/{role}.stderr\"\n\
         echo $? >\"$SWEEP_OUTPUT_DIR/{role}.exit_code\"\n",
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
        command = command,
        role = p.role,
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
    fn script_embeds_trial_identity_and_command() {
        let manager = ManagerEndpoint::new("10.0.0.5", 8081);
        let script = render_run_script(&RunScriptParams {
            platform: "kubeflow",
            experiment_id: "exp42",
            trial_id: "abc12345",
            sequence_id: 3,
            role: "worker",
            command: "python3 train.py --lr 0.1",
            trial_dir: "/mnt/sweep/exp42/trials/abc12345",
            code_dir: "/mnt/sweep/exp42/code",
            manager: &manager,
            version: "0.1.0",
            log_collection: "none",
        });

        assert!(script.contains("export SWEEP_TRIAL_ID=abc12345"));
        assert!(script.contains("export SWEEP_SEQ_ID=3"));
        assert!(script.contains("export SWEEP_CALLBACK_URL=http://10.0.0.5:8081"));
        assert!(script.contains("eval 'python3 train.py --lr 0.1'"));
        assert!(script.contains("worker.exit_code"));
    }

    #[test]
    fn single_quotes_in_commands_survive() {
        assert_eq!(escape_single_quotes("echo 'hi'"), "echo '\\''hi'\\''");
    }
}
