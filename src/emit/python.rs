//! Built-in Python template set
//!
//! Each table gets its own module holding a dataclass record and CRUD helpers.
//! Enums, procs and queries are gathered into one module per namespace, and an
//! `__init__.py` re-exports everything.

use super::{Granularity, KindTemplates, PackageTemplate, TemplateSet, TypeSyntax};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda", "nonlocal",
    "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

pub fn python_templates() -> TemplateSet {
    TemplateSet {
        name: "python".to_string(),
        syntax: TypeSyntax {
            array: "list[{}]".to_string(),
            nullable: "{} | None".to_string(),
            local_import: Some("from .{module} import {name}".to_string()),
            reserved: KEYWORDS.iter().map(|k| k.to_string()).collect(),
        },
        tables: Some(
            KindTemplates::new(
                include_str!("templates/python/record.py.jinja"),
                "{{ namespace }}/{{ name }}.py",
                Granularity::PerEntity,
            )
            .with_wrapper(include_str!("templates/python/module.py.jinja")),
        ),
        enums: Some(
            KindTemplates::new(
                include_str!("templates/python/enum.py.jinja"),
                "{{ namespace }}/enums.py",
                Granularity::PerNamespace,
            )
            .with_wrapper(include_str!("templates/python/enums.py.jinja")),
        ),
        procs: Some(
            KindTemplates::new(
                include_str!("templates/python/proc.py.jinja"),
                "{{ namespace }}/procs.py",
                Granularity::PerNamespace,
            )
            .with_wrapper(include_str!("templates/python/procs.py.jinja")),
        ),
        queries: Some(
            KindTemplates::new(
                include_str!("templates/python/query.py.jinja"),
                "{{ namespace }}/queries.py",
                Granularity::PerNamespace,
            )
            .with_wrapper(include_str!("templates/python/queries.py.jinja")),
        ),
        package: Some(PackageTemplate {
            source: include_str!("templates/python/init.py.jinja").to_string(),
            file_id: "{{ namespace }}/__init__.py".to_string(),
        }),
    }
}
