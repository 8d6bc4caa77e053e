//! End-to-end pipeline behavior through a Tree: compression + encryption
//! stacked, reopen with the same roots, reopen with a root missing.

use std::sync::Arc;

use acorn_core::{AcornError, CachePolicy, PipelineError, Root, Tree, Trunk};
use acorn_roots::{CompressionRoot, EncryptionRoot};
use acorn_trunk_mem::MemoryTrunk;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Doc {
    text: String,
}

fn roots(with_encryption: bool) -> Vec<Arc<dyn Root>> {
    let mut roots: Vec<Arc<dyn Root>> = vec![Arc::new(CompressionRoot::gzip(100))];
    if with_encryption {
        roots.push(Arc::new(EncryptionRoot::from_password(
            200,
            "squirrel",
            "oak-salt",
        )));
    }
    roots
}

#[test]
fn compressed_encrypted_round_trip_and_reopen() {
    let trunk = Arc::new(MemoryTrunk::new());
    let doc = Doc {
        text: "repetitive acorn payload. ".repeat(400),
    };

    {
        let tree: Tree<Doc> = Tree::builder(Arc::clone(&trunk))
            .roots(roots(true))
            .open()
            .unwrap();
        tree.stash_with("doc", doc.clone()).unwrap();

        // compression must actually bite through the whole stack
        let stored = trunk.load("doc").unwrap().unwrap();
        assert!(
            stored.payload.len() * 10 < doc.text.len() * 3,
            "stored {} bytes for a {} byte payload",
            stored.payload.len(),
            doc.text.len()
        );
        assert_eq!(stored.sequences, vec![100, 200]);
        assert_eq!(tree.crack("doc").unwrap().unwrap(), doc);
        tree.close().unwrap();
    }

    // same roots, fresh Tree: decodes fine
    {
        let tree: Tree<Doc> = Tree::builder(Arc::clone(&trunk))
            .roots(roots(true))
            .cache(CachePolicy::Off)
            .open()
            .unwrap();
        assert_eq!(tree.crack("doc").unwrap().unwrap(), doc);
        tree.close().unwrap();
    }

    // encryption root removed: decode must name the missing sequence
    {
        let tree: Tree<Doc> = Tree::builder(Arc::clone(&trunk))
            .roots(roots(false))
            .cache(CachePolicy::Off)
            .open()
            .unwrap();
        let err = tree.crack("doc").unwrap_err();
        assert!(matches!(
            err,
            AcornError::Pipeline(PipelineError::MissingRoot { sequence: 200 })
        ));
    }
}

#[test]
fn pipeline_order_survives_reconfiguration_order() {
    // Roots handed over in the "wrong" order still encode ascending.
    let trunk = Arc::new(MemoryTrunk::new());
    let tree: Tree<Doc> = Tree::builder(Arc::clone(&trunk))
        .root(EncryptionRoot::from_key(200, [3u8; 32]))
        .root(CompressionRoot::brotli(100))
        .open()
        .unwrap();

    let doc = Doc {
        text: "ordering check".into(),
    };
    tree.stash_with("k", doc.clone()).unwrap();
    assert_eq!(
        trunk.load("k").unwrap().unwrap().sequences,
        vec![100, 200],
        "compression (100) must run before encryption (200)"
    );
    assert_eq!(tree.crack("k").unwrap().unwrap(), doc);
}
