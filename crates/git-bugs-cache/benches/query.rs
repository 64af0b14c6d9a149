#![allow(missing_docs, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};

use criterion::{Criterion, criterion_group, criterion_main};
use git_bugs_cache::query::evaluate;
use git_bugs_cache::{BugExcerpt, BugExcerpts, IdentityExcerpt, IdentityExcerpts, Query};
use git_bugs_core::{BugId, IdentityId, Label, Status};

fn identity_dataset(size: usize) -> IdentityExcerpts {
    let mut identities = IdentityExcerpts::default();
    for index in 0..size {
        identities.insert(IdentityExcerpt {
            id: IdentityId::from_content(format!("identity-{index}").as_bytes()),
            name: format!("Contributor {index}"),
            login: Some(format!("user{index}")),
            avatar_url: None,
            immutable_metadata: BTreeMap::new(),
        });
    }
    identities
}

fn bug_dataset(size: usize, authors: usize) -> BugExcerpts {
    let mut bugs = BugExcerpts::default();
    for index in 0..size {
        let author = IdentityId::from_content(format!("identity-{}", index % authors).as_bytes());
        let mut labels = BTreeSet::new();
        if index % 2 == 0 {
            labels.insert(Label::new("bug"));
        }
        labels.insert(Label::new(format!("team-{}", index % 4)));
        let status = if index % 5 == 0 {
            Status::Closed
        } else {
            Status::Open
        };
        bugs.insert(BugExcerpt {
            id: BugId::from_content(format!("bug-{index}").as_bytes()),
            create_lamport_time: index as u64 + 1,
            edit_lamport_time: index as u64 + 2,
            create_unix_time: 1_700_000_000 + index as i64,
            edit_unix_time: 1_700_000_100 + index as i64,
            status,
            labels,
            title: format!("Benchmark bug {index}"),
            len_comments: 1,
            author: author.clone(),
            actors: BTreeSet::from([author.clone()]),
            participants: BTreeSet::from([author]),
            create_metadata: BTreeMap::new(),
        });
    }
    bugs
}

fn bench_bug_query(c: &mut Criterion) {
    let identities = identity_dataset(50);
    let bugs = bug_dataset(5_000, 50);
    let open_bugs = Query::parse("status:open label:bug").expect("parse query");
    let by_author = Query::parse("author:contributor sort:edit-asc").expect("parse query");

    c.bench_function("bug_query_open_labelled", |b| {
        b.iter(|| evaluate(Some(&open_bugs), &bugs, &identities));
    });
    c.bench_function("bug_query_author_sorted", |b| {
        b.iter(|| evaluate(Some(&by_author), &bugs, &identities));
    });
}

criterion_group!(query_benches, bench_bug_query);
criterion_main!(query_benches);
