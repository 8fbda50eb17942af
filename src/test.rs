use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::{executor, future};

use crate::{CancellationToken, Loader};

fn echo(
    calls: Arc<AtomicUsize>,
) -> impl Fn(&CancellationToken, &[String]) -> future::Ready<Vec<Result<String, &'static str>>> + Clone
{
    move |_ctx, keys| {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(keys.iter().map(|key| Ok(format!("res:{key}"))).collect())
    }
}

#[test]
fn nearby_loads_share_one_backend_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Loader::new(CancellationToken::new(), echo(Arc::clone(&calls)));

    let first = loader.load("a".to_string());
    let second = loader.load("b".to_string());

    let token = CancellationToken::new();
    assert_eq!(
        executor::block_on(first.get(&token)),
        Ok("res:a".to_string())
    );
    assert_eq!(
        executor::block_on(second.get(&token)),
        Ok("res:b".to_string())
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_keys_share_one_thunk() {
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = Loader::new(CancellationToken::new(), echo(Arc::clone(&calls)));

    let first = loader.load("a".to_string());
    let again = loader.load("a".to_string());

    let token = CancellationToken::new();
    assert_eq!(
        executor::block_on(first.get(&token)),
        Ok("res:a".to_string())
    );
    assert_eq!(
        executor::block_on(again.get(&token)),
        Ok("res:a".to_string())
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
