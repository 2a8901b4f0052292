use {
    anyhow::Context,
    futures::{Future, FutureExt, TryFutureExt},
    std::fmt::Display,
};

#[extension_traits::extension(pub trait FutureAnyhowExt)]
impl<F, T, E> F
where
    F: Future<Output = Result<T, E>> + Sized,
    E: std::error::Error + Send + Sync + 'static,
{
    fn map_context(self, context: &'static str) -> impl Future<Output = anyhow::Result<T>> {
        self.map_err(anyhow::Error::from).map(move |res| res.context(context))
    }
    fn map_with_context<C, MakeContext>(self, make_context: MakeContext) -> impl Future<Output = anyhow::Result<T>>
    where
        C: Display + Send + Sync + 'static,
        MakeContext: FnOnce() -> C,
    {
        self.map_err(anyhow::Error::from)
            .map(move |res| res.with_context(make_context))
    }
}
