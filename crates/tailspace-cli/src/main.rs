use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tailspace_alloc::{Inspection, RepairReport, inspect, repair};
use tailspace_error::TailspaceError;
use tailspace_types::Layout;
use tailspace_vfd::UnixVfs;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliOptions {
    layout: Layout,
    inspect_only: bool,
    dry_run: bool,
    json: bool,
    files: Vec<PathBuf>,
    show_help: bool,
}

#[derive(Debug, Serialize)]
struct FileOutcome<'a> {
    path: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    inspection: Option<&'a Inspection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair: Option<&'a RepairReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let exit_code = run(std::env::args_os(), &mut stdout, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run<I, W, E>(args: I, out: &mut W, err: &mut E) -> i32
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let options = match parse_args(args) {
        Ok(options) => options,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            let _ = write_usage(err);
            return 2;
        }
    };

    if options.show_help {
        if write_usage(out).is_err() {
            return 1;
        }
        return 0;
    }

    let vfs = UnixVfs::new();
    let mut exit_code = 0;
    for path in &options.files {
        let result = if options.inspect_only {
            inspect(&vfs, path, options.layout).map(|inspection| {
                write_inspection(out, path, &inspection, options.json)
            })
        } else {
            repair(&vfs, path, options.layout, options.dry_run)
                .map(|report| write_repair(out, path, &report, options.json))
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(io_error)) => {
                let _ = writeln!(err, "error: {io_error}");
                return 1;
            }
            Err(error) => {
                write_failure(out, err, path, &error, options.json);
                exit_code = 1;
            }
        }
    }
    exit_code
}

fn parse_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut iter = args.into_iter();
    let _argv0 = iter.next();

    let mut layout = Layout::Single;
    let mut inspect_only = false;
    let mut dry_run = false;
    let mut json = false;
    let mut files = Vec::new();
    let mut show_help = false;
    let mut options_done = false;

    for argument in iter {
        let arg = argument.to_string_lossy();
        if options_done {
            files.push(PathBuf::from(&argument));
            continue;
        }
        match arg.as_ref() {
            "-h" | "--help" => show_help = true,
            "--multi" => layout = Layout::Multi,
            "--inspect" => inspect_only = true,
            "--dry-run" => dry_run = true,
            "--json" => json = true,
            "--" => options_done = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown option `{other}`"));
            }
            _ => files.push(PathBuf::from(&argument)),
        }
    }

    if inspect_only && dry_run {
        return Err(String::from("`--inspect` cannot be combined with `--dry-run`"));
    }
    if files.is_empty() && !show_help {
        return Err(String::from("missing FILE argument"));
    }

    Ok(CliOptions {
        layout,
        inspect_only,
        dry_run,
        json,
        files,
        show_help,
    })
}

fn write_inspection<W: Write>(
    out: &mut W,
    path: &Path,
    inspection: &Inspection,
    json: bool,
) -> io::Result<()> {
    if json {
        return write_json(
            out,
            &FileOutcome {
                path,
                inspection: Some(inspection),
                repair: None,
                error: None,
            },
        );
    }
    writeln!(
        out,
        "{}: {} layout, {} objects{}",
        path.display(),
        inspection.layout,
        inspection.objects,
        if inspection.needs_repair() {
            ", needs repair"
        } else {
            ""
        }
    )?;
    for member in &inspection.members {
        let record = match (&member.record, &member.record_error) {
            (Some(rec), _) => format!(
                "record eoa={} mode={} flag={:?}",
                rec.recorded_eoa, rec.mode, rec.flag
            ),
            (None, Some(error)) => format!("record unreadable ({error})"),
            (None, None) => String::from("no record"),
        };
        writeln!(
            out,
            "  member {}: eoa={} derived={} eof={} {} [{}]",
            member.member, member.table_eoa, member.derived_eoa, member.eof, record, member.compat
        )?;
    }
    Ok(())
}

fn write_repair<W: Write>(
    out: &mut W,
    path: &Path,
    report: &RepairReport,
    json: bool,
) -> io::Result<()> {
    if json {
        return write_json(
            out,
            &FileOutcome {
                path,
                inspection: None,
                repair: Some(report),
                error: None,
            },
        );
    }
    let verdict = match (report.changed, report.dry_run) {
        (false, _) => "already consistent",
        (true, true) => "would repair",
        (true, false) => "repaired",
    };
    writeln!(out, "{}: {verdict}", path.display())?;
    if report.changed {
        for member in &report.members {
            writeln!(
                out,
                "  member {}: eof {} -> {}{}",
                member.member,
                member.eof_before,
                member.eoa,
                if member.record_removed {
                    ", record removed"
                } else {
                    ""
                }
            )?;
        }
    }
    Ok(())
}

fn write_failure<W: Write, E: Write>(
    out: &mut W,
    err: &mut E,
    path: &Path,
    error: &TailspaceError,
    json: bool,
) {
    if json {
        let _ = write_json(
            out,
            &FileOutcome {
                path,
                inspection: None,
                repair: None,
                error: Some(error.to_string()),
            },
        );
        return;
    }
    let _ = writeln!(err, "error: {}: {error}", path.display());
    if let Some(hint) = error.suggestion() {
        let _ = writeln!(err, "hint: {hint}");
    }
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *out, value).map_err(io::Error::other)?;
    writeln!(out)
}

fn write_usage<W>(out: &mut W) -> io::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        "Usage: tailspace-extend [--multi] [--inspect | --dry-run] [--json] FILE...\n\
         \n\
         Rewrite containers written with avoid-truncate so that every member\n\
         file ends at its allocation mark and carries no extension record.\n\
         \n\
         Options:\n\
         \n\
         --multi     FILE is the base name of a multi-member container\n\
         --inspect   report allocation state without modifying anything\n\
         --dry-run   report what would be repaired without writing\n\
         --json      one JSON object per FILE\n\
         \n\
         Exit status: 0 success, 1 a FILE failed, 2 usage error\n",
    )
}
