//! Synthesis of the `bench` CLI arguments for a backup run. Pure; the arg
//! contract is pinned by tests because the tenant tooling parses it.

use crate::crd::backup::SiteBackupSpec;

pub fn backup_args(spec: &SiteBackupSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["--site".into(), spec.site.clone(), "backup".into()];
    if spec.with_files {
        args.push("--with-files".into());
    }
    if spec.compress {
        args.push("--compress".into());
    }
    let paths = [
        ("--backup-path", &spec.backup_path),
        ("--backup-path-db", &spec.backup_path_db),
        ("--backup-path-conf", &spec.backup_path_conf),
        ("--backup-path-files", &spec.backup_path_files),
        ("--backup-path-private-files", &spec.backup_path_private_files),
    ];
    for (flag, value) in paths {
        if let Some(value) = value {
            args.push(flag.into());
            args.push(value.clone());
        }
    }
    if !spec.exclude.is_empty() {
        args.push("--exclude".into());
        args.push(spec.exclude.join(","));
    }
    if !spec.include.is_empty() {
        args.push("--include".into());
        args.push(spec.include.join(","));
    }
    if spec.ignore_backup_conf {
        args.push("--ignore-backup-conf".into());
    }
    if spec.verbose {
        args.push("--verbose".into());
    }
    args
}
