use anyhow::{bail, Result};
use subuser::backend::DockerBackend;
use subuser::commands::{self, Environment};
use subuser::paths::Paths;

fn usage() -> &'static str {
    "Usage:\n  subuser subuser add <name> <image>[@<repository|uri|path>]\n  subuser subuser remove <name>...\n  subuser update all\n  subuser update subusers <name>...\n  subuser update lock-subuser-to <name> <commit>\n  subuser update unlock-subuser <name>\n  subuser repair\n  subuser remove-old-images [--dry-run] [--repo=ID]\n  subuser list <available|subusers|installed-images|repositories> [--json]\n  subuser repository add <name> <uri|path>\n  subuser repository remove <name>\n  subuser registry log\n  subuser registry rollback <commit>\n  subuser registry live-log"
}

fn main() {
    if let Err(e) = run() {
        eprintln!("subuser: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let paths = Paths::resolve()?;

    match args.as_slice() {
        [group, add, name, image] if group == "subuser" && add == "add" => {
            commands::add_subuser(&docker_env(paths)?, name, image)
        }
        [group, remove, names @ ..] if group == "subuser" && remove == "remove" && !names.is_empty() => {
            commands::remove_subusers(&docker_env(paths)?, names)
        }
        [update, all] if update == "update" && all == "all" => {
            commands::update_all(&docker_env(paths)?)
        }
        [update, subusers, names @ ..]
            if update == "update" && subusers == "subusers" && !names.is_empty() =>
        {
            commands::update_subusers(&docker_env(paths)?, names)
        }
        [update, lock, name, commit] if update == "update" && lock == "lock-subuser-to" => {
            commands::lock_subuser_to(&docker_env(paths)?, name, commit)
        }
        [update, unlock, name] if update == "update" && unlock == "unlock-subuser" => {
            commands::unlock_subuser(&docker_env(paths)?, name)
        }
        [repair] if repair == "repair" => commands::repair(&docker_env(paths)?),
        [remove_old, rest @ ..] if remove_old == "remove-old-images" => {
            let (dry_run, repo) = parse_removal_flags(rest)?;
            commands::remove_old_images(&docker_env(paths)?, dry_run, repo.as_deref())
        }
        [list, what, rest @ ..] if list == "list" => {
            let json = parse_json_flag(rest)?;
            let output = match what.as_str() {
                "available" => commands::list_available(&paths, json)?,
                "subusers" => commands::list_subusers(&paths, json)?,
                "installed-images" => commands::list_installed_images(&paths, json)?,
                "repositories" => commands::list_repositories(&paths, json)?,
                other => bail!("unknown listing '{other}'\n{}", usage()),
            };
            print!("{output}");
            Ok(())
        }
        [repository, add, name, origin] if repository == "repository" && add == "add" => {
            commands::add_repository(&docker_env(paths)?, name, origin)
        }
        [repository, remove, name] if repository == "repository" && remove == "remove" => {
            commands::remove_repository(&docker_env(paths)?, name)
        }
        [registry, log] if registry == "registry" && log == "log" => {
            print!("{}", commands::registry_history(&paths)?);
            Ok(())
        }
        [registry, rollback, commit] if registry == "registry" && rollback == "rollback" => {
            commands::rollback(&docker_env(paths)?, commit)
        }
        [registry, live_log] if registry == "registry" && live_log == "live-log" => {
            commands::live_log(&paths)
        }
        _ => bail!(usage()),
    }
}

/// Connects to the daemon eagerly so a misconfigured host fails with setup
/// guidance before any state is touched.
fn docker_env(paths: Paths) -> Result<Environment> {
    let backend = DockerBackend::connect()?;
    Ok(Environment {
        paths,
        backend: Box::new(backend),
    })
}

fn parse_removal_flags(rest: &[String]) -> Result<(bool, Option<String>)> {
    let mut dry_run = false;
    let mut repo = None;
    for arg in rest {
        if arg == "--dry-run" {
            dry_run = true;
        } else if let Some(id) = arg.strip_prefix("--repo=") {
            repo = Some(id.to_string());
        } else {
            bail!("unknown argument '{arg}'\n{}", usage());
        }
    }
    Ok((dry_run, repo))
}

fn parse_json_flag(rest: &[String]) -> Result<bool> {
    match rest {
        [] => Ok(false),
        [flag] if flag == "--json" => Ok(true),
        _ => bail!(usage()),
    }
}
