mod rewriter;
