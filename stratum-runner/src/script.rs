//! Step scripts and generated workspace files
//!
//! Scripts run with the task workspace as working directory. The repository
//! is checked out into `code/` and every terraform/ansible step works from
//! `code/<workdir>`, so files of the workspace root are addressed through
//! [`up_to_workspace`].

use std::collections::BTreeMap;
use stratum_core::domain::step::{StepType, step_dir_name};
use stratum_core::dto::task::RunTaskRequest;

use crate::config::parse_bool;
use crate::workspace::{
    BACKEND_TF_FILE, LOG_FILE, PLAY_VARS_FILE, SCRIPT_FILE, SSH_KEY_FILE, TF_PLAN_JSON_FILE,
    TF_STATE_JSON_FILE,
};

/// Task workspace inside the container
pub const CONTAINER_WORKSPACE: &str = "/stratum/workspace";
/// Read-only assets (terraformrc, ansible inventory script)
pub const CONTAINER_ASSETS_DIR: &str = "/stratum/assets";
pub const CONTAINER_PLUGIN_CACHE_DIR: &str = "/stratum/terraform/plugins-cache";

pub const DEFAULT_TERRAFORM_VERSION: &str = "1.5.7";

const TF_PLAN_FILE: &str = "_stratum.tfplan";
const ANSIBLE_INVENTORY_SCRIPT: &str = "terraform.py";

/// Enables `sh -x` tracing of the step script
pub const DEBUG_VAR: &str = "STRATUM_DEBUG";
/// Overrides `RUNNER_RESERVE_CONTAINER` for one request
pub const RESERVE_CONTAINER_VAR: &str = "STRATUM_RESERVE_CONTAINER";
/// System variables with this prefix are also exposed to playbooks
const SYS_VAR_PREFIX: &str = "STRATUM_";

/// Wraps `s` in single quotes for `/bin/sh`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Relative path from `code/<workdir>` back to `name` in the workspace root
pub fn up_to_workspace(workdir: &str, name: &str) -> String {
    let depth = workdir
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .count();
    let mut path = "../".repeat(depth + 1);
    path.push_str(name);
    path
}

fn code_dir(req: &RunTaskRequest) -> String {
    let workdir = req.env.workdir.trim_matches('/');
    if workdir.is_empty() {
        shell_quote("code")
    } else {
        shell_quote(&format!("code/{}", workdir))
    }
}

fn step_args(req: &RunTaskRequest) -> String {
    req.step_args
        .iter()
        .map(|a| format!(" {}", a))
        .collect()
}

/// Generates `run.sh` for the request's step type
pub fn step_script(req: &RunTaskRequest) -> String {
    let workdir = &req.env.workdir;
    let cd = code_dir(req);

    match req.step_type {
        StepType::Checkout => format!(
            "#!/bin/sh\n\
             if [ ! -e code ]; then git clone {repo} code 2>&1 | sed -re 's#(://[^:]+:)[^@]+#\\1******#' || exit $?; fi && \\\n\
             cd code && \\\n\
             echo 'checkout {commit}.' && \\\n\
             git checkout -q {quoted_commit}\n",
            repo = shell_quote(&req.repo_address),
            commit = req.repo_commit_id.replace('\'', ""),
            quoted_commit = shell_quote(&req.repo_commit_id),
        ),
        StepType::Init => format!(
            "#!/bin/sh\n\
             cd {cd} && \\\n\
             ln -sf {backend} . && \\\n\
             ln -sf {tfrc} ~/.terraformrc && \\\n\
             tfenv install $TFENV_TERRAFORM_VERSION && \\\n\
             tfenv use $TFENV_TERRAFORM_VERSION && \\\n\
             terraform init -input=false{args}\n",
            backend = up_to_workspace(workdir, BACKEND_TF_FILE),
            tfrc = format!("{}/terraformrc-default", CONTAINER_ASSETS_DIR),
            args = step_args(req),
        ),
        StepType::Plan => {
            let var_file = if req.env.tf_vars_file.is_empty() {
                String::new()
            } else {
                format!(" -var-file={}", shell_quote(&req.env.tf_vars_file))
            };
            format!(
                "#!/bin/sh\n\
                 cd {cd} && \\\n\
                 terraform plan -input=false -out={plan}{var_file}{args} && \\\n\
                 terraform show -no-color -json {plan} >{plan_json}\n",
                plan = TF_PLAN_FILE,
                args = step_args(req),
                plan_json = up_to_workspace(workdir, TF_PLAN_JSON_FILE),
            )
        }
        // destroy applies a plan created with `-destroy`
        StepType::Apply | StepType::Destroy => format!(
            "#!/bin/sh\n\
             cd {cd} && \\\n\
             terraform apply -input=false -auto-approve{args} {plan}\n",
            args = step_args(req),
            plan = TF_PLAN_FILE,
        ),
        StepType::Play => {
            let extra_vars = if req.env.play_vars_file.is_empty() {
                String::new()
            } else {
                format!(" \\\n--extra-vars @{}", shell_quote(&req.env.play_vars_file))
            };
            format!(
                "#!/bin/sh\n\
                 export ANSIBLE_HOST_KEY_CHECKING=\"False\"\n\
                 export ANSIBLE_TF_DIR=\".\"\n\
                 export ANSIBLE_NOCOWS=\"1\"\n\n\
                 cd {cd} && ansible-playbook \\\n\
                 --inventory {inventory} \\\n\
                 --user \"root\" \\\n\
                 --private-key {key} \\\n\
                 --extra-vars @{play_vars}{extra_vars}{args} \\\n\
                 {playbook}\n",
                inventory = format!("{}/{}", CONTAINER_ASSETS_DIR, ANSIBLE_INVENTORY_SCRIPT),
                key = up_to_workspace(workdir, SSH_KEY_FILE),
                play_vars = up_to_workspace(workdir, PLAY_VARS_FILE),
                args = step_args(req),
                playbook = shell_quote(&req.env.playbook),
            )
        }
        StepType::Command => {
            let mut script = format!("#!/bin/sh\ntest -d {cd} && cd {cd}\n");
            for command in &req.step_args {
                script.push_str(command);
                script.push('\n');
            }
            script
        }
        // failures of the collect step never change the task status
        StepType::Collect => format!(
            "#!/bin/sh\n\
             cd {cd} && \\\n\
             terraform show -no-color -json >{state_json}\n",
            state_json = up_to_workspace(workdir, TF_STATE_JSON_FILE),
        ),
    }
}

/// Main process of the step container
///
/// Runs `run.sh` of the step directory and appends everything it prints to
/// the step log.
pub fn container_command(req: &RunTaskRequest) -> Vec<String> {
    let dir = step_dir_name(req.step);
    let trace = match req.env.environment_vars.get(DEBUG_VAR) {
        Some(v) if parse_bool(v) == Some(true) => " -x",
        _ => "",
    };

    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "/bin/sh{trace} {dir}/{script} >>{dir}/{log} 2>&1",
            script = SCRIPT_FILE,
            log = LOG_FILE,
        ),
    ]
}

/// Environment of the step container
///
/// User variables first, then system variables which win on conflict, then
/// terraform variables with the `TF_VAR_` prefix.
pub fn container_env(req: &RunTaskRequest) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = req
        .env
        .environment_vars
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    env.entry("TF_PLUGIN_CACHE_DIR".to_string())
        .or_insert_with(|| CONTAINER_PLUGIN_CACHE_DIR.to_string());

    for (k, v) in &req.sys_environments {
        env.insert(k.clone(), v.clone());
    }

    for (k, v) in &req.env.terraform_vars {
        env.insert(format!("TF_VAR_{}", k), v.clone());
    }

    let tf_version = if req.env.tf_version.is_empty() {
        DEFAULT_TERRAFORM_VERSION
    } else {
        req.env.tf_version.as_str()
    };
    env.insert("TFENV_TERRAFORM_VERSION".to_string(), tf_version.to_string());

    env.into_iter().collect()
}

/// Content of `_stratum.tf`, the state backend configuration
pub fn backend_tf(req: &RunTaskRequest, default_address: &str) -> String {
    let store = &req.state_store;
    let address = if store.address.is_empty() {
        default_address
    } else {
        store.address.as_str()
    };
    let backend = if store.backend.is_empty() {
        "consul"
    } else {
        store.backend.as_str()
    };
    let scheme = if store.scheme.is_empty() {
        "http"
    } else {
        store.scheme.as_str()
    };

    format!(
        r#"terraform {{
  backend "{backend}" {{
    address = "{address}"
    scheme  = "{scheme}"
    path    = "{path}"
    lock    = true
    gzip    = false
  }}
}}

locals {{
  stratum_ssh_user    = "root"
  stratum_private_key = "{key}"
}}
"#,
        path = store.path,
        key = up_to_workspace(&req.env.workdir, SSH_KEY_FILE),
    )
}

/// Content of `_stratum_play_vars.json`
///
/// Ansible variables of the environment plus `STRATUM_*` system variables
/// under their lower-cased names.
pub fn play_vars(req: &RunTaskRequest) -> serde_json::Result<Vec<u8>> {
    let mut vars: BTreeMap<String, String> = req
        .env
        .ansible_vars
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (k, v) in &req.sys_environments {
        if k.starts_with(SYS_VAR_PREFIX) {
            vars.insert(k.to_ascii_lowercase(), v.clone());
        }
    }

    serde_json::to_vec_pretty(&vars)
}

/// Main process of the one-shot container that force-unlocks the state of
/// an aborted step
///
/// Runs from the workspace root like the step itself and appends its output
/// to the step log.
pub fn unlock_command(req: &RunTaskRequest) -> Vec<String> {
    let dir = step_dir_name(req.step);
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "{{ if cd {cd} && terraform state list >/dev/null; then terraform force-unlock -force {path}; else echo 'Not initialized'; fi; }} >>{dir}/{log} 2>&1",
            cd = code_dir(req),
            path = shell_quote(&req.state_store.path),
            log = LOG_FILE,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(step_type: StepType) -> RunTaskRequest {
        serde_json::from_value(serde_json::json!({
            "taskId": "t-1",
            "stepType": step_type,
            "env": { "id": "e-1", "workdir": "infra/prod" },
        }))
        .unwrap()
    }

    #[test]
    fn test_up_to_workspace() {
        assert_eq!(up_to_workspace("", "ssh_key"), "../ssh_key");
        assert_eq!(up_to_workspace("infra/prod", "tfplan.json"), "../../../tfplan.json");
        assert_eq!(up_to_workspace("./infra/", "x"), "../../x");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_plan_script() {
        let mut req = request(StepType::Plan);
        req.env.tf_vars_file = "prod.tfvars".to_string();
        req.step_args = vec!["-lock=false".to_string()];

        let script = step_script(&req);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("cd 'code/infra/prod'"));
        assert!(script.contains("-var-file='prod.tfvars' -lock=false"));
        assert!(script.contains(">../../../tfplan.json"));
    }

    #[test]
    fn test_command_script_runs_each_arg() {
        let mut req = request(StepType::Command);
        req.step_args = vec!["echo one".to_string(), "echo two".to_string()];

        let script = step_script(&req);
        assert!(script.ends_with("echo one\necho two\n"));
    }

    #[test]
    fn test_container_command_appends_to_log() {
        let mut req = request(StepType::Init);
        req.step = 2;
        let cmd = container_command(&req);
        assert_eq!(cmd[2], "/bin/sh step2/run.sh >>step2/output.log 2>&1");

        req.env
            .environment_vars
            .insert(DEBUG_VAR.to_string(), "true".to_string());
        assert!(container_command(&req)[2].starts_with("/bin/sh -x "));
    }

    #[test]
    fn test_unlock_command_logs_to_the_step() {
        let mut req = request(StepType::Apply);
        req.step = 1;
        req.state_store.path = "prod/terraform.tfstate".to_string();

        let cmd = unlock_command(&req);
        assert!(cmd[2].contains("cd 'code/infra/prod'"));
        assert!(cmd[2].contains("force-unlock -force 'prod/terraform.tfstate'"));
        assert!(cmd[2].ends_with(">>step1/output.log 2>&1"));
    }

    #[test]
    fn test_container_env_precedence() {
        let mut req = request(StepType::Plan);
        req.env.environment_vars = HashMap::from([
            ("REGION".to_string(), "user".to_string()),
            ("TF_PLUGIN_CACHE_DIR".to_string(), "/custom".to_string()),
        ]);
        req.sys_environments = HashMap::from([("REGION".to_string(), "system".to_string())]);
        req.env.terraform_vars = HashMap::from([("size".to_string(), "3".to_string())]);

        let env: HashMap<_, _> = container_env(&req).into_iter().collect();
        assert_eq!(env["REGION"], "system");
        assert_eq!(env["TF_PLUGIN_CACHE_DIR"], "/custom");
        assert_eq!(env["TF_VAR_size"], "3");
        assert_eq!(env["TFENV_TERRAFORM_VERSION"], DEFAULT_TERRAFORM_VERSION);
    }

    #[test]
    fn test_backend_tf_defaults_address() {
        let mut req = request(StepType::Init);
        req.state_store.path = "stratum/e-1".to_string();

        let tf = backend_tf(&req, "consul:8500");
        assert!(tf.contains("backend \"consul\""));
        assert!(tf.contains("address = \"consul:8500\""));
        assert!(tf.contains("path    = \"stratum/e-1\""));
    }

    #[test]
    fn test_play_vars_include_system_vars() {
        let mut req = request(StepType::Play);
        req.env.ansible_vars = HashMap::from([("port".to_string(), "80".to_string())]);
        req.sys_environments = HashMap::from([
            ("STRATUM_ENV_ID".to_string(), "e-1".to_string()),
            ("OTHER".to_string(), "x".to_string()),
        ]);

        let vars: HashMap<String, String> =
            serde_json::from_slice(&play_vars(&req).unwrap()).unwrap();
        assert_eq!(vars["port"], "80");
        assert_eq!(vars["stratum_env_id"], "e-1");
        assert!(!vars.contains_key("other"));
    }
}
